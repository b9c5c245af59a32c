//! Per-channel metadata and buffering.

use std::sync::Mutex;

use log::warn;
use serde::{Deserialize, Serialize};

use crate::buffer::RingBuffer;
use crate::mat::{MatVar, NumericData};
use crate::value::Value;
use crate::{TelematError, TelematResult};

/// The declared shape and naming of a channel.
///
/// `dimensions` is the shape of a single sample (`[1]` for scalars,
/// `[2, 3]` for a matrix, ...). `elements_names` names each of the
/// `dimensions.product()` elements of a sample and is synthesized as
/// `element_0 ... element_{k-1}` when omitted. `units_of_measure` is empty,
/// a single unit broadcast to all elements, or one unit per element.
/// `type_name` reports the element type bound by the channel's first push;
/// it is informational in configuration files.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChannelInfo {
    pub name: String,
    pub dimensions: Vec<usize>,
    #[serde(default)]
    pub type_name: String,
    #[serde(default)]
    pub elements_names: Vec<String>,
    #[serde(default)]
    pub units_of_measure: Vec<String>,
}

impl ChannelInfo {
    pub fn new(name: impl Into<String>, dimensions: impl Into<Vec<usize>>) -> Self {
        Self {
            name: name.into(),
            dimensions: dimensions.into(),
            ..Self::default()
        }
    }

    pub fn with_elements_names<S: Into<String>>(
        mut self,
        names: impl IntoIterator<Item = S>,
    ) -> Self {
        self.elements_names = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_units_of_measure<S: Into<String>>(
        mut self,
        units: impl IntoIterator<Item = S>,
    ) -> Self {
        self.units_of_measure = units.into_iter().map(Into::into).collect();
        self
    }

    /// Validates the shape and fills in derived fields: synthesizes element
    /// names when missing (warning on a length mismatch) and broadcasts a
    /// single unit of measure to every element. Returns the element count of
    /// one sample.
    pub(crate) fn normalize(&mut self) -> TelematResult<usize> {
        if self.dimensions.is_empty() || self.dimensions.iter().any(|&d| d == 0) {
            return Err(TelematError::InvalidDimensions {
                channel: self.name.clone(),
                dimensions: self.dimensions.clone(),
            });
        }
        let elements: usize = self.dimensions.iter().product();

        if self.elements_names.is_empty() {
            self.elements_names = (0..elements).map(|i| format!("element_{i}")).collect();
        } else if self.elements_names.len() != elements {
            warn!(
                "channel `{}`: expected {} element names, got {}",
                self.name,
                elements,
                self.elements_names.len()
            );
        }

        if self.units_of_measure.len() == 1 && elements > 1 {
            let unit = self.units_of_measure[0].clone();
            self.units_of_measure = vec![unit; elements];
        } else if !self.units_of_measure.is_empty() && self.units_of_measure.len() != elements {
            warn!(
                "channel `{}`: expected {} units of measure, got {}",
                self.name,
                elements,
                self.units_of_measure.len()
            );
        }

        Ok(elements)
    }
}

/// Concatenates a drained buffer into the channel's single `data` variable.
pub(crate) type EncodeFn = Box<dyn Fn(&RingBuffer) -> MatVar + Send>;

/// The mutable half of a channel, guarded by its own mutex: the ring buffer,
/// the type tag, and the encoder, the latter two bound by the first push.
pub(crate) struct ChannelState {
    pub buffer: RingBuffer,
    pub type_tag: Option<&'static str>,
    pub encode: Option<EncodeFn>,
}

/// One registered channel: immutable metadata plus the locked state shared
/// between producers and the flusher.
pub(crate) struct ChannelBuffer {
    pub info: ChannelInfo,
    pub elements: usize,
    pub state: Mutex<ChannelState>,
}

impl ChannelBuffer {
    pub fn new(info: ChannelInfo, elements: usize, capacity: usize) -> Self {
        Self {
            info,
            elements,
            state: Mutex::new(ChannelState {
                buffer: RingBuffer::new(capacity),
                type_tag: None,
                encode: None,
            }),
        }
    }
}

/// Builds the encoder for a channel from the first pushed value: numeric
/// buffers concatenate on a trailing time dimension, records become a struct
/// array, anything else a cell array.
pub(crate) fn make_encoder(first: &Value, dimensions: Vec<usize>) -> EncodeFn {
    match first {
        Value::Numeric(data) => {
            let class = data.class();
            Box::new(move |buffer| {
                let mut concatenated = NumericData::with_class(class);
                for record in buffer.iter() {
                    if let Value::Numeric(sample) = &record.value {
                        concatenated.extend_from(sample);
                    }
                }
                let mut dims = dimensions.clone();
                dims.push(buffer.len());
                MatVar::Numeric {
                    dims,
                    data: concatenated,
                }
            })
        }
        Value::Record(_) => Box::new(move |buffer| {
            let mut fields: Vec<String> = Vec::new();
            let mut elements: Vec<Vec<MatVar>> = Vec::with_capacity(buffer.len());
            for (i, record) in buffer.iter().enumerate() {
                let Value::Record(pairs) = &record.value else {
                    continue;
                };
                if i == 0 {
                    fields = pairs.iter().map(|(name, _)| name.clone()).collect();
                }
                let element = fields
                    .iter()
                    .map(|field| {
                        match pairs.iter().find(|(name, _)| name == field) {
                            Some((_, value)) => value.to_mat(),
                            None => {
                                warn!("record sample is missing field `{field}`");
                                MatVar::row(NumericData::Double(Vec::new()))
                            }
                        }
                    })
                    .collect();
                elements.push(element);
            }
            MatVar::Struct {
                dims: vec![1, elements.len()],
                fields,
                elements,
            }
        }),
        Value::Any(_) => Box::new(move |buffer| {
            let cells = buffer.iter().map(|record| record.value.to_mat()).collect();
            MatVar::cell_row(cells)
        }),
    }
}

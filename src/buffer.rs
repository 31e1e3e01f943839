//! Caller-owned input and output buffers
//!
//! [`Input`] and [`Output`] borrow typed slices for one evaluation call.
//! [`Column`] is an owned counterpart used by the CLI and by tests.

use num_complex::Complex;

use crate::dtype::Dtype;
use crate::value::{Element, Value};

/// Expand `$m!` once per numeric dtype with `(Variant, rust type)` pairs
macro_rules! for_each_numeric {
    ($m:ident) => {
        $m! {
            Bool => bool,
            Int8 => i8,
            Int16 => i16,
            Int32 => i32,
            Int64 => i64,
            UInt8 => u8,
            UInt16 => u16,
            UInt32 => u32,
            UInt64 => u64,
            Float32 => f32,
            Float64 => f64,
            Complex64 => Complex<f32>,
            Complex128 => Complex<f64>,
        }
    };
}

macro_rules! define_buffers {
    ($($variant:ident => $t:ty),* $(,)?) => {
        /// A borrowed input array
        #[derive(Debug, Clone, Copy)]
        pub enum Input<'a> {
            $($variant(&'a [$t]),)*
            /// UCS-4 code points, `itemsize / 4` per element
            Str { data: &'a [u32], itemsize: usize },
        }

        /// A borrowed output array
        #[derive(Debug)]
        pub enum Output<'a> {
            $($variant(&'a mut [$t]),)*
        }

        /// An owned array
        #[derive(Debug, Clone, PartialEq)]
        pub enum Column {
            $($variant(Vec<$t>),)*
            Str { data: Vec<u32>, itemsize: usize },
        }

        impl<'a> Input<'a> {
            pub fn dtype(&self) -> Dtype {
                match self {
                    $(Input::$variant(_) => <$t as Element>::DTYPE,)*
                    Input::Str { .. } => Dtype::String,
                }
            }

            /// Number of elements
            pub fn len(&self) -> usize {
                match self {
                    $(Input::$variant(data) => data.len(),)*
                    Input::Str { data, itemsize } => match itemsize / 4 {
                        0 => 0,
                        chars => data.len() / chars,
                    },
                }
            }

            pub fn is_empty(&self) -> bool {
                self.len() == 0
            }

            /// Element `index` as a value. Strings read as `Bool(false)`.
            pub fn get(&self, index: usize) -> Value {
                match self {
                    $(Input::$variant(data) => data[index].into_value(),)*
                    Input::Str { .. } => Value::Bool(false),
                }
            }

            /// Code points of string element `index` (empty for numeric inputs)
            pub fn str_at(&self, index: usize) -> &'a [u32] {
                match *self {
                    Input::Str { data, itemsize } => {
                        let chars = itemsize / 4;
                        &data[index * chars..(index + 1) * chars]
                    }
                    _ => &[],
                }
            }

            pub fn itemsize(&self) -> usize {
                match self {
                    Input::Str { itemsize, .. } => *itemsize,
                    other => other.dtype().itemsize(),
                }
            }
        }

        impl<'a> Output<'a> {
            pub fn dtype(&self) -> Dtype {
                match self {
                    $(Output::$variant(_) => <$t as Element>::DTYPE,)*
                }
            }

            pub fn len(&self) -> usize {
                match self {
                    $(Output::$variant(data) => data.len(),)*
                }
            }

            pub fn is_empty(&self) -> bool {
                self.len() == 0
            }

            /// Store a value, casting it to the buffer dtype
            pub fn set(&mut self, index: usize, value: Value) {
                match self {
                    $(Output::$variant(data) => data[index] = <$t as Element>::from_value(value),)*
                }
            }

            /// Zero every element in `range`
            pub fn zero(&mut self, range: std::ops::Range<usize>) {
                match self {
                    $(Output::$variant(data) => {
                        let zero = <$t as Element>::from_value(Value::Bool(false));
                        data[range].iter_mut().for_each(|slot| *slot = zero);
                    })*
                }
            }
        }

        impl Column {
            /// A zero-filled column
            pub fn zeros(dtype: Dtype, len: usize) -> Option<Column> {
                match dtype {
                    $(Dtype::$variant => Some(Column::$variant(
                        vec![<$t as Element>::from_value(Value::Bool(false)); len]
                    )),)*
                    _ => None,
                }
            }

            /// Build a column of `dtype` from values (cast with C semantics)
            pub fn from_values(dtype: Dtype, values: &[Value]) -> Option<Column> {
                match dtype {
                    $(Dtype::$variant => Some(Column::$variant(
                        values.iter().map(|v| <$t as Element>::from_value(*v)).collect()
                    )),)*
                    _ => None,
                }
            }

            /// Build a string column padded with NULs to `itemsize` bytes per element
            pub fn from_strs(items: &[&str], itemsize: usize) -> Column {
                let chars = itemsize / 4;
                let mut data = vec![0u32; chars * items.len()];
                for (slot, item) in data.chunks_mut(chars.max(1)).zip(items) {
                    for (cell, c) in slot.iter_mut().zip(item.chars()) {
                        *cell = c as u32;
                    }
                }
                Column::Str { data, itemsize }
            }

            pub fn dtype(&self) -> Dtype {
                self.as_input().dtype()
            }

            pub fn len(&self) -> usize {
                self.as_input().len()
            }

            pub fn is_empty(&self) -> bool {
                self.len() == 0
            }

            pub fn get(&self, index: usize) -> Value {
                self.as_input().get(index)
            }

            pub fn as_input(&self) -> Input<'_> {
                match self {
                    $(Column::$variant(data) => Input::$variant(data),)*
                    Column::Str { data, itemsize } => Input::Str { data, itemsize: *itemsize },
                }
            }

            /// Mutable view; string columns cannot be written and yield `None`
            pub fn as_output(&mut self) -> Option<Output<'_>> {
                match self {
                    $(Column::$variant(data) => Some(Output::$variant(data)),)*
                    Column::Str { .. } => None,
                }
            }

            pub fn values(&self) -> Vec<Value> {
                (0..self.len()).map(|i| self.get(i)).collect()
            }
        }

        $(
            impl<'a> From<&'a [$t]> for Input<'a> {
                fn from(data: &'a [$t]) -> Self {
                    Input::$variant(data)
                }
            }

            impl<'a> From<&'a Vec<$t>> for Input<'a> {
                fn from(data: &'a Vec<$t>) -> Self {
                    Input::$variant(data)
                }
            }

            impl<'a> From<&'a mut [$t]> for Output<'a> {
                fn from(data: &'a mut [$t]) -> Self {
                    Output::$variant(data)
                }
            }

            impl<'a> From<&'a mut Vec<$t>> for Output<'a> {
                fn from(data: &'a mut Vec<$t>) -> Self {
                    Output::$variant(data)
                }
            }

            impl From<Vec<$t>> for Column {
                fn from(data: Vec<$t>) -> Self {
                    Column::$variant(data)
                }
            }
        )*
    };
}

for_each_numeric!(define_buffers);

impl<'a> Input<'a> {
    pub fn as_f64(&self) -> Option<&'a [f64]> {
        match *self {
            Input::Float64(data) => Some(data),
            _ => None,
        }
    }

    pub fn as_f32(&self) -> Option<&'a [f32]> {
        match *self {
            Input::Float32(data) => Some(data),
            _ => None,
        }
    }
}

impl<'a> Output<'a> {
    pub fn as_f64_mut(&mut self) -> Option<&mut [f64]> {
        match self {
            Output::Float64(data) => Some(data),
            _ => None,
        }
    }

    pub fn as_f32_mut(&mut self) -> Option<&mut [f32]> {
        match self {
            Output::Float32(data) => Some(data),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_input_views() {
        let data = vec![1i16, -2, 3];
        let input = Input::from(&data);
        assert_eq!(input.dtype(), Dtype::Int16);
        assert_eq!(input.len(), 3);
        assert_eq!(input.get(1), Value::Int16(-2));
        assert_eq!(input.itemsize(), 2);
        assert!(input.as_f64().is_none());
    }

    #[test]
    fn test_output_casts_and_zeroes() {
        let mut data = vec![7u8; 4];
        let mut out = Output::from(&mut data);
        out.set(0, Value::Float64(3.9));
        out.set(1, Value::Int64(-1));
        out.zero(2..4);
        assert_eq!(out.dtype(), Dtype::UInt8);
        assert_eq!(data, vec![3, 255, 0, 0]);
    }

    #[test]
    fn test_string_columns() {
        let column = Column::from_strs(&["ab", "xyz"], 12);
        let input = column.as_input();
        assert_eq!(input.dtype(), Dtype::String);
        assert_eq!(input.len(), 2);
        assert_eq!(input.str_at(0), &['a' as u32, 'b' as u32, 0]);
        assert_eq!(input.str_at(1), &['x' as u32, 'y' as u32, 'z' as u32]);
        assert_eq!(input.itemsize(), 12);
    }

    #[test]
    fn test_columns() {
        let column = Column::from_values(Dtype::Float32, &[Value::Int64(2), Value::Bool(true)]).unwrap();
        assert_eq!(column, Column::Float32(vec![2.0, 1.0]));
        let mut zeros = Column::zeros(Dtype::Complex64, 2).unwrap();
        assert_eq!(zeros.as_output().map(|o| o.len()), Some(2));
        assert!(Column::zeros(Dtype::String, 2).is_none());
    }
}

//! Layer parameter dictionaries.

use rustc_hash::FxHashMap;

/// A parameter value.
#[derive(Clone, Debug, PartialEq)]
pub enum ParamValue {
    Int(i32),
    Float(f32),
    IntArray(Vec<i32>),
    FloatArray(Vec<f32>),
}

/// Map of parameter index to value.
///
/// Layers document a default for every index they read. Getters return that
/// default when an index is unset, so a missing parameter is never an error.
#[derive(Clone, Debug, Default)]
pub struct ParamDict {
    params: FxHashMap<u32, ParamValue>,
}

impl ParamDict {
    pub fn new() -> ParamDict {
        ParamDict::default()
    }

    pub fn set(&mut self, id: u32, value: ParamValue) {
        self.params.insert(id, value);
    }

    pub fn set_int(&mut self, id: u32, value: i32) {
        self.set(id, ParamValue::Int(value));
    }

    pub fn set_float(&mut self, id: u32, value: f32) {
        self.set(id, ParamValue::Float(value));
    }

    /// Builder-style variant of [`set_int`](Self::set_int).
    pub fn with_int(mut self, id: u32, value: i32) -> Self {
        self.set_int(id, value);
        self
    }

    /// Builder-style variant of [`set_float`](Self::set_float).
    pub fn with_float(mut self, id: u32, value: f32) -> Self {
        self.set_float(id, value);
        self
    }

    /// Builder-style setter for float arrays.
    pub fn with_floats(mut self, id: u32, values: &[f32]) -> Self {
        self.set(id, ParamValue::FloatArray(values.to_vec()));
        self
    }

    /// Builder-style setter for int arrays.
    pub fn with_ints(mut self, id: u32, values: &[i32]) -> Self {
        self.set(id, ParamValue::IntArray(values.to_vec()));
        self
    }

    pub fn contains(&self, id: u32) -> bool {
        self.params.contains_key(&id)
    }

    /// Return an integer parameter. Floats are truncated.
    pub fn get_int(&self, id: u32, default: i32) -> i32 {
        match self.params.get(&id) {
            Some(ParamValue::Int(v)) => *v,
            Some(ParamValue::Float(v)) => *v as i32,
            _ => default,
        }
    }

    /// Return a float parameter. Integers are converted.
    pub fn get_float(&self, id: u32, default: f32) -> f32 {
        match self.params.get(&id) {
            Some(ParamValue::Float(v)) => *v,
            Some(ParamValue::Int(v)) => *v as f32,
            _ => default,
        }
    }

    /// Return a float array parameter, or an empty array if unset.
    pub fn get_floats(&self, id: u32) -> Vec<f32> {
        match self.params.get(&id) {
            Some(ParamValue::FloatArray(v)) => v.clone(),
            Some(ParamValue::IntArray(v)) => v.iter().map(|&x| x as f32).collect(),
            Some(ParamValue::Float(v)) => vec![*v],
            _ => Vec::new(),
        }
    }

    /// Return an int array parameter, or an empty array if unset.
    pub fn get_ints(&self, id: u32) -> Vec<i32> {
        match self.params.get(&id) {
            Some(ParamValue::IntArray(v)) => v.clone(),
            Some(ParamValue::Int(v)) => vec![*v],
            _ => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{ParamDict, ParamValue};

    #[test]
    fn test_defaults_for_unset_params() {
        let pd = ParamDict::new();
        assert_eq!(pd.get_int(0, 7), 7);
        assert_eq!(pd.get_float(1, 0.5), 0.5);
        assert!(pd.get_floats(2).is_empty());
        assert!(pd.get_ints(3).is_empty());
    }

    #[test]
    fn test_conversions() {
        let pd = ParamDict::new()
            .with_int(0, 3)
            .with_float(1, 2.5)
            .with_ints(2, &[1, 2])
            .with_floats(3, &[0.5]);

        assert_eq!(pd.get_float(0, 0.), 3.);
        assert_eq!(pd.get_int(1, 0), 2);
        assert_eq!(pd.get_floats(2), [1., 2.]);
        assert_eq!(pd.get_ints(0), [3]);
        assert_eq!(pd.get_floats(3), [0.5]);

        // Arrays don't coerce to scalars.
        assert_eq!(pd.get_int(2, -1), -1);
    }

    #[test]
    fn test_overwrite() {
        let mut pd = ParamDict::new();
        pd.set_int(4, 1);
        pd.set(4, ParamValue::Float(9.));
        assert!(pd.contains(4));
        assert_eq!(pd.get_float(4, 0.), 9.);
    }
}

use crate::layer::{storage_dtype, Layer, LayerError, LayerState, OutputList};
use crate::mat::Mat;
use crate::ops::activation::map_in_place;
use crate::options::RunOptions;
use crate::param::ParamDict;

/// Inference-time dropout, which scales the input by a constant.
///
/// With the default scale of 1 the output is another handle to the input.
#[derive(Default)]
pub struct Dropout {
    scale: f32,
    state: LayerState,
}

impl Dropout {
    pub fn new() -> Dropout {
        Dropout::default()
    }
}

impl Layer for Dropout {
    fn type_name(&self) -> &'static str {
        "Dropout"
    }

    fn load_param(&mut self, params: &ParamDict) -> Result<(), LayerError> {
        self.state.check_not_ready()?;
        self.scale = params.get_float(0, 1.);
        self.state = LayerState::Configured;
        Ok(())
    }

    fn create_pipeline(&mut self, _opt: &RunOptions) -> Result<(), LayerError> {
        self.state.check_configured()?;
        self.state = LayerState::Ready;
        Ok(())
    }

    fn forward(&self, inputs: &[Mat], opt: &RunOptions) -> Result<OutputList, LayerError> {
        self.state.check_ready()?;
        let input = inputs.first().ok_or(LayerError::MissingInputs)?;
        if self.scale == 1. {
            return Ok([input.clone()].into());
        }

        let dtype = storage_dtype(input, opt)?;
        let mut out = input.deep_clone(&opt.blob_allocator())?;
        let scale = self.scale;
        map_in_place(&mut out, dtype, opt.num_threads, &|x| x * scale)?;
        Ok([out].into())
    }

    fn destroy_pipeline(&mut self, _opt: &RunOptions) -> Result<(), LayerError> {
        self.state = LayerState::Unconfigured;
        Ok(())
    }

    fn state(&self) -> LayerState {
        self.state
    }
}

#[cfg(test)]
mod tests {
    use packnn_testing::expect_all_close;

    use crate::mat::Mat;
    use crate::ops::testing::{random_mat, run_layer, unpacked_values};
    use crate::options::RunOptions;
    use crate::packing::convert_packing;
    use crate::param::ParamDict;

    #[test]
    fn test_dropout_default_scale_aliases_input() {
        let input = Mat::from_f32(&[3, 2], &[1., 2., 3., 4., 5., 6.]).unwrap();
        let opt = RunOptions::default();
        let out = run_layer("Dropout", &ParamDict::new(), &[], &[input.clone()], &opt).unwrap();
        assert!(out[0].shares_storage(&input));
    }

    #[test]
    fn test_dropout_scale() -> Result<(), String> {
        let mut rng = fastrand::Rng::with_seed(1234);
        let input = random_mat(&mut rng, &[5, 4, 8]);
        let values = input.to_vec::<f32>().unwrap();
        let opt = RunOptions::default();
        let packed = convert_packing(&input, 8, &opt.workspace_allocator()).unwrap();

        let params = ParamDict::new().with_float(0, 0.5);
        let out = run_layer("Dropout", &params, &[], &[packed.clone()], &opt).map_err(|e| e.to_string())?;
        assert!(!out[0].shares_storage(&packed));
        assert_eq!(out[0].elempack(), 8);

        let expected: Vec<f32> = values.iter().map(|x| x * 0.5).collect();
        expect_all_close(&unpacked_values(&out[0], &opt), &expected, 1e-6, 1e-6)?;

        // The input is unchanged.
        expect_all_close(&unpacked_values(&packed, &opt), &values, 0., 0.)
    }
}

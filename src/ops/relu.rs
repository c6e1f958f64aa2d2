use crate::layer::{storage_dtype, Layer, LayerError, LayerState, OutputList};
use crate::mat::Mat;
use crate::ops::activation::{activate_in_place, Activation};
use crate::options::RunOptions;
use crate::param::ParamDict;

/// Rectified linear unit, with an optional negative slope.
#[derive(Default)]
pub struct ReLU {
    slope: f32,
    state: LayerState,
}

impl ReLU {
    pub fn new() -> ReLU {
        ReLU::default()
    }

    fn activation(&self) -> Activation {
        if self.slope == 0. {
            Activation::Relu
        } else {
            Activation::LeakyRelu { slope: self.slope }
        }
    }
}

impl Layer for ReLU {
    fn type_name(&self) -> &'static str {
        "ReLU"
    }

    fn load_param(&mut self, params: &ParamDict) -> Result<(), LayerError> {
        self.state.check_not_ready()?;
        self.slope = params.get_float(0, 0.);
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
        let dtype = storage_dtype(input, opt)?;
        let mut out = input.deep_clone(&opt.blob_allocator())?;
        activate_in_place(&mut out, self.activation(), dtype, opt.num_threads)?;
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
    use packnn_testing::{expect_all_close, TestCases};

    use crate::convert::cast_to_float16;
    use crate::ops::testing::{random_mat, run_layer, unpacked_values};
    use crate::options::RunOptions;
    use crate::packing::convert_packing;
    use crate::param::ParamDict;

    #[test]
    fn test_relu() {
        #[derive(Debug)]
        struct Case {
            slope: f32,
            elempack: usize,
        }

        let cases = [
            Case {
                slope: 0.,
                elempack: 1,
            },
            Case {
                slope: 0.1,
                elempack: 4,
            },
            Case {
                slope: 0.,
                elempack: 8,
            },
        ];

        cases.test_each(|case| {
            let mut rng = fastrand::Rng::with_seed(1234);
            let input = random_mat(&mut rng, &[7, 3, 8]);
            let values = input.to_vec::<f32>().unwrap();
            let opt = RunOptions::default();
            let input = convert_packing(&input, case.elempack, &opt.workspace_allocator()).unwrap();

            let params = ParamDict::new().with_float(0, case.slope);
            let out = run_layer("ReLU", &params, &[], &[input], &opt).unwrap();
            let expected: Vec<f32> = values
                .iter()
                .map(|&x| if x < 0. { x * case.slope } else { x })
                .collect();
            expect_all_close(&unpacked_values(&out[0], &opt), &expected, 1e-6, 1e-7).unwrap();
        });
    }

    #[test]
    fn test_relu_fp16() -> Result<(), String> {
        let mut rng = fastrand::Rng::with_seed(1234);
        let input = random_mat(&mut rng, &[16]);
        let values = input.to_vec::<f32>().unwrap();
        let opt = RunOptions {
            use_fp16_storage: true,
            ..RunOptions::default()
        };
        let input = cast_to_float16(&input, &opt.workspace_allocator()).map_err(|e| e.to_string())?;

        let out = run_layer("ReLU", &ParamDict::new(), &[], &[input], &opt).map_err(|e| e.to_string())?;
        assert_eq!(out[0].scalar_size(), 2);
        let expected: Vec<f32> = values.iter().map(|x| x.max(0.)).collect();
        expect_all_close(&unpacked_values(&out[0], &opt), &expected, 1e-3, 1e-3)
    }
}

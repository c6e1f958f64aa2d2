//! Operators implementing the [`Layer`](crate::layer::Layer) trait.

mod activation;
mod convolution;
mod deconvolution;
mod dropout;
mod expanddims;
mod innerproduct;
mod interp;
mod layernorm;
mod pooling1d;
mod relu;
mod rnn;

pub use activation::Activation;
pub use convolution::Convolution;
pub use deconvolution::Deconvolution;
pub use dropout::Dropout;
pub use expanddims::ExpandDims;
pub use innerproduct::InnerProduct;
pub use interp::{Interp, ResizeType};
pub use layernorm::LayerNorm;
pub use pooling1d::{PadMode, Pooling1D, PoolingType};
pub use relu::ReLU;
pub use rnn::{Direction, Rnn};

/// Helpers shared by operator tests.
#[cfg(test)]
pub(crate) mod testing {
    use crate::allocator::system_allocator;
    use crate::convert::{cast_from_bfloat16, cast_from_float16};
    use crate::kernels::DType;
    use crate::layer::{create_layer, storage_dtype, Layer, LayerError, OutputList};
    use crate::mat::Mat;
    use crate::options::RunOptions;
    use crate::packing::convert_packing;
    use crate::param::ParamDict;

    /// Return `n` values uniformly distributed in `[-1, 1)`.
    pub fn random_values(rng: &mut fastrand::Rng, n: usize) -> Vec<f32> {
        (0..n).map(|_| rng.f32() * 2. - 1.).collect()
    }

    /// Return an unpacked f32 tensor filled with random values.
    pub fn random_mat(rng: &mut fastrand::Rng, shape: &[usize]) -> Mat {
        let data = random_values(rng, shape.iter().product());
        Mat::from_f32(shape, &data).unwrap()
    }

    /// Return the values of a tensor as unpacked f32 in `c, d, h, w` order,
    /// whatever its storage type and packing.
    pub fn unpacked_values(mat: &Mat, opt: &RunOptions) -> Vec<f32> {
        let alloc = system_allocator();
        let unpacked = convert_packing(mat, 1, &alloc).unwrap();
        let f32_mat = match storage_dtype(mat, opt).unwrap() {
            DType::F32 | DType::Int8 => unpacked,
            DType::Bf16Storage => cast_from_bfloat16(&unpacked, &alloc).unwrap(),
            DType::F16Storage | DType::F16Arith => cast_from_float16(&unpacked, &alloc).unwrap(),
        };
        f32_mat.to_vec::<f32>().unwrap()
    }

    /// Create a layer, load its parameters and weights and create its
    /// pipeline.
    pub fn ready_layer(
        type_name: &str,
        params: &ParamDict,
        weights: &[Mat],
        opt: &RunOptions,
    ) -> Result<Box<dyn Layer>, LayerError> {
        let mut layer = create_layer(type_name).unwrap();
        layer.load_param(params)?;
        layer.load_model(weights)?;
        layer.create_pipeline(opt)?;
        Ok(layer)
    }

    /// Run a freshly created layer once.
    pub fn run_layer(
        type_name: &str,
        params: &ParamDict,
        weights: &[Mat],
        inputs: &[Mat],
        opt: &RunOptions,
    ) -> Result<OutputList, LayerError> {
        ready_layer(type_name, params, weights, opt)?.forward(inputs, opt)
    }
}

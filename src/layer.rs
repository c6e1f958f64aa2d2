//! The [`Layer`] trait implemented by operators, and its error type.

use std::error::Error;
use std::fmt;

use rayon::prelude::*;
use smallvec::SmallVec;

use crate::allocator::AllocError;
use crate::convert::{cast_from_bfloat16, cast_from_float16, cast_to_bfloat16, cast_to_float16};
use crate::kernels::{select_dtype, DType};
use crate::mat::{Mat, MatError};
use crate::ops;
use crate::options::RunOptions;
use crate::packing::convert_packing;
use crate::param::ParamDict;
use crate::threading::thread_pool;

/// Lifecycle state of a layer.
///
/// ```text
/// Unconfigured --load_param--> Configured --create_pipeline--> Ready
/// Ready --destroy_pipeline--> Unconfigured
/// ```
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum LayerState {
    #[default]
    Unconfigured,
    Configured,
    Ready,
}

impl LayerState {
    /// Check that a layer may run.
    pub(crate) fn check_ready(self) -> Result<(), LayerError> {
        match self {
            LayerState::Ready => Ok(()),
            state => Err(LayerError::NotReady(state)),
        }
    }

    /// Check that a layer may create its pipeline.
    pub(crate) fn check_configured(self) -> Result<(), LayerError> {
        match self {
            LayerState::Configured => Ok(()),
            LayerState::Ready => Err(LayerError::PipelineExists),
            state => Err(LayerError::NotReady(state)),
        }
    }

    /// Check that a layer may accept new parameters.
    pub(crate) fn check_not_ready(self) -> Result<(), LayerError> {
        match self {
            LayerState::Ready => Err(LayerError::PipelineExists),
            _ => Ok(()),
        }
    }
}

/// Reasons why a layer operation may fail.
#[derive(Clone, Debug, PartialEq)]
pub enum LayerError {
    /// An allocator failed to provide an output or scratch buffer.
    AllocationFailed,

    /// The operation is not valid in the layer's current state.
    NotReady(LayerState),

    /// `create_pipeline` was called on a layer which already has one.
    PipelineExists,

    /// Weights needed to create the pipeline have not been loaded, or were
    /// released after a previous pipeline was created in light mode.
    MissingWeights(&'static str),

    /// A parameter has an invalid value.
    InvalidParam(&'static str),

    /// Input shapes are not compatible with each other or the parameters.
    IncompatibleShape(&'static str),

    /// Fewer inputs were provided than the layer requires.
    MissingInputs,

    /// An input has an element type the layer does not support.
    UnsupportedType,

    /// The kernel selected for the current options differs from the one the
    /// pipeline was created for.
    PlanMismatch,

    /// A tensor operation failed.
    Mat(MatError),
}

impl LayerError {
    /// Status code for this error: -100 for allocation failures and -1 for
    /// everything else. Success is 0.
    pub fn status_code(&self) -> i32 {
        match self {
            LayerError::AllocationFailed => -100,
            _ => -1,
        }
    }
}

/// Convert the result of a layer operation to a status code.
pub fn status_code<T>(result: &Result<T, LayerError>) -> i32 {
    match result {
        Ok(_) => 0,
        Err(err) => err.status_code(),
    }
}

impl fmt::Display for LayerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LayerError::AllocationFailed => write!(f, "buffer allocation failed"),
            LayerError::NotReady(state) => write!(f, "layer is in state {:?}", state),
            LayerError::PipelineExists => write!(f, "pipeline was already created"),
            LayerError::MissingWeights(name) => write!(f, "weights not loaded: {}", name),
            LayerError::InvalidParam(details) => write!(f, "invalid parameter: {}", details),
            LayerError::IncompatibleShape(details) => {
                write!(f, "incompatible input shapes: {}", details)
            }
            LayerError::MissingInputs => write!(f, "required inputs were missing"),
            LayerError::UnsupportedType => write!(f, "unsupported input type"),
            LayerError::PlanMismatch => {
                write!(f, "options differ from those the pipeline was created with")
            }
            LayerError::Mat(err) => write!(f, "{}", err),
        }
    }
}

impl Error for LayerError {}

impl From<MatError> for LayerError {
    fn from(err: MatError) -> LayerError {
        match err {
            MatError::Alloc(_) => LayerError::AllocationFailed,
            other => LayerError::Mat(other),
        }
    }
}

impl From<AllocError> for LayerError {
    fn from(_: AllocError) -> LayerError {
        LayerError::AllocationFailed
    }
}

/// Outputs produced by [`Layer::forward`].
pub type OutputList = SmallVec<[Mat; 1]>;

/// An operator instance: parameters, weights and the kernels selected to
/// run it.
///
/// Layers are configured with [`load_param`](Layer::load_param) and
/// [`load_model`](Layer::load_model), prepared with
/// [`create_pipeline`](Layer::create_pipeline), which selects kernels and
/// transforms weights into the layout they expect, and then run any number of
/// times with [`forward`](Layer::forward).
pub trait Layer: Send + Sync {
    /// Return the operator name, eg. "Convolution".
    fn type_name(&self) -> &'static str;

    /// Read parameters. Unset parameters take their documented defaults.
    fn load_param(&mut self, params: &ParamDict) -> Result<(), LayerError>;

    /// Load raw weights, as unpacked f32 tensors in the order the layer
    /// documents.
    fn load_model(&mut self, #[allow(unused)] weights: &[Mat]) -> Result<(), LayerError> {
        Ok(())
    }

    /// Select kernels for `opt` and prepare weights for them.
    fn create_pipeline(&mut self, opt: &RunOptions) -> Result<(), LayerError>;

    /// Run the layer.
    ///
    /// `opt` must select the same kernels as the options the pipeline was
    /// created with.
    fn forward(&self, inputs: &[Mat], opt: &RunOptions) -> Result<OutputList, LayerError>;

    /// Release the pipeline and return to the unconfigured state.
    fn destroy_pipeline(&mut self, opt: &RunOptions) -> Result<(), LayerError>;

    fn state(&self) -> LayerState;
}

/// Create pipelines for independent layers concurrently.
///
/// Returns the first error encountered, if any.
pub fn create_pipelines(layers: &mut [Box<dyn Layer>], opt: &RunOptions) -> Result<(), LayerError> {
    thread_pool().run(|| {
        layers
            .par_iter_mut()
            .try_for_each(|layer| layer.create_pipeline(opt))
    })
}

/// Create an unconfigured layer given its operator name.
pub fn create_layer(type_name: &str) -> Option<Box<dyn Layer>> {
    let layer: Box<dyn Layer> = match type_name {
        "Convolution" => Box::new(ops::Convolution::new()),
        "Deconvolution" => Box::new(ops::Deconvolution::new()),
        "Dropout" => Box::new(ops::Dropout::new()),
        "ExpandDims" => Box::new(ops::ExpandDims::new()),
        "InnerProduct" => Box::new(ops::InnerProduct::new()),
        "Interp" => Box::new(ops::Interp::new()),
        "LayerNorm" => Box::new(ops::LayerNorm::new()),
        "Pooling1D" => Box::new(ops::Pooling1D::new()),
        "ReLU" => Box::new(ops::ReLU::new()),
        "RNN" => Box::new(ops::Rnn::new()),
        _ => return None,
    };
    Some(layer)
}

/// Return the storage type of an activation tensor.
///
/// 2-byte scalars are bf16 if `opt` selects bf16 storage and f16 otherwise.
pub(crate) fn storage_dtype(mat: &Mat, opt: &RunOptions) -> Result<DType, LayerError> {
    match mat.scalar_size() {
        4 => Ok(DType::F32),
        2 => match select_dtype(opt, false) {
            DType::Bf16Storage => Ok(DType::Bf16Storage),
            DType::F16Arith => Ok(DType::F16Arith),
            _ => Ok(DType::F16Storage),
        },
        _ => Err(LayerError::UnsupportedType),
    }
}

/// Convert an input to the storage type of `dtype` and to `elempack`
/// packing, allocating from the workspace allocator.
///
/// Returns another handle to `input` if no conversion is needed.
pub(crate) fn prepare_input(
    input: &Mat,
    dtype: DType,
    elempack: usize,
    opt: &RunOptions,
) -> Result<Mat, LayerError> {
    let alloc = opt.workspace_allocator();
    let input_dtype = storage_dtype(input, opt)?;

    let cast = match (input_dtype, dtype) {
        (DType::F32, DType::F16Storage | DType::F16Arith) => cast_to_float16(input, &alloc)?,
        (DType::F32, DType::Bf16Storage) => cast_to_bfloat16(input, &alloc)?,
        (DType::Bf16Storage, DType::F32 | DType::Int8) => cast_from_bfloat16(input, &alloc)?,
        (DType::F16Storage | DType::F16Arith, DType::F32 | DType::Int8) => {
            cast_from_float16(input, &alloc)?
        }
        _ => input.clone(),
    };
    Ok(convert_packing(&cast, elempack, &alloc)?)
}

/// Evaluate an expression with a type alias bound to the storage type of a
/// [`DType`].
macro_rules! match_storage {
    ($dtype:expr, $S:ident => $body:expr) => {{
        use $crate::kernels::DType;
        match $dtype {
            DType::F32 | DType::Int8 => {
                type $S = f32;
                $body
            }
            DType::F16Storage | DType::F16Arith => {
                type $S = packnn_base::F16;
                $body
            }
            DType::Bf16Storage => {
                type $S = packnn_base::Bf16;
                $body
            }
        }
    }};
}

pub(crate) use match_storage;

/// Return the f32 data of a weight tensor, checking its length.
pub(crate) fn weight_data<'a>(
    weights: &'a [Mat],
    index: usize,
    len: usize,
    name: &'static str,
) -> Result<&'a [f32], LayerError> {
    let mat = weights.get(index).ok_or(LayerError::MissingWeights(name))?;
    if mat.elempack() != 1 || mat.scalar_size() != 4 {
        return Err(LayerError::UnsupportedType);
    }
    let data = mat.data::<f32>()?;
    if mat.dims() > 2 || data.len() != len {
        return Err(LayerError::IncompatibleShape(name));
    }
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::{create_layer, create_pipelines, status_code, Layer, LayerError, LayerState};
    use crate::allocator::AllocError;
    use crate::mat::{Mat, MatError};
    use crate::options::RunOptions;
    use crate::param::ParamDict;

    #[test]
    fn test_status_codes() {
        assert_eq!(status_code(&Ok::<(), LayerError>(())), 0);
        assert_eq!(
            status_code::<()>(&Err(LayerError::from(AllocError { bytes: 8 }))),
            -100
        );
        assert_eq!(
            status_code::<()>(&Err(LayerError::from(MatError::Alloc(AllocError { bytes: 8 })))),
            -100
        );
        assert_eq!(status_code::<()>(&Err(LayerError::PipelineExists)), -1);
        assert_eq!(
            status_code::<()>(&Err(LayerError::from(MatError::Shared))),
            -1
        );
    }

    #[test]
    fn test_state_checks() {
        assert_eq!(
            LayerState::Unconfigured.check_ready(),
            Err(LayerError::NotReady(LayerState::Unconfigured))
        );
        assert_eq!(
            LayerState::Ready.check_configured(),
            Err(LayerError::PipelineExists)
        );
        assert!(LayerState::Configured.check_configured().is_ok());
        assert!(LayerState::Ready.check_ready().is_ok());
    }

    #[test]
    fn test_create_layer() {
        for name in [
            "Convolution",
            "Deconvolution",
            "Dropout",
            "ExpandDims",
            "InnerProduct",
            "Interp",
            "LayerNorm",
            "Pooling1D",
            "ReLU",
            "RNN",
        ] {
            let layer = create_layer(name).unwrap();
            assert_eq!(layer.type_name(), name);
            assert_eq!(layer.state(), LayerState::Unconfigured);
        }
        assert!(create_layer("Softmax").is_none());
    }

    #[test]
    fn test_create_pipelines_concurrently() {
        let opt = RunOptions::default();
        let mut layers: Vec<Box<dyn Layer>> = (0..8)
            .map(|i| {
                let mut layer = create_layer("InnerProduct").unwrap();
                let params = ParamDict::new().with_int(0, 4).with_int(2, 4 * (i + 1));
                layer.load_param(&params).unwrap();
                let weights: Vec<f32> = (0..4 * (i + 1)).map(|x| x as f32).collect();
                layer
                    .load_model(&[Mat::from_f32(&[weights.len()], &weights).unwrap()])
                    .unwrap();
                layer
            })
            .collect();

        create_pipelines(&mut layers, &opt).unwrap();
        assert!(layers.iter().all(|l| l.state() == LayerState::Ready));

        let input = Mat::from_f32(&[3], &[1., 2., 3.]).unwrap();
        let out = layers[2].forward(&[input], &opt).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].logical_channels(), 4);

        // All pipelines exist, so a second attempt fails.
        assert_eq!(
            create_pipelines(&mut layers, &opt),
            Err(LayerError::PipelineExists)
        );
    }
}

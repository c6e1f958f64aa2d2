use tracing::debug;

use crate::layer::{Layer, LayerError, LayerState, OutputList};
use crate::mat::Mat;
use crate::options::RunOptions;
use crate::packing::convert_packing;
use crate::param::ParamDict;

/// Axes to insert, in `[w, h, d, c]` order.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
struct ExpandAxes {
    w: bool,
    h: bool,
    d: bool,
    c: bool,
}

impl ExpandAxes {
    /// Map `axes`, numbered outermost first in the output shape, to the axes
    /// they insert for an input with `dims` dimensions.
    fn from_axes(axes: &[i32], dims: usize) -> ExpandAxes {
        let mut expand = ExpandAxes::default();
        for &axis in axes {
            let axis = if axis < 0 {
                dims as i32 + 1 + axis
            } else {
                axis
            };
            match (dims, axis) {
                (1, 0) | (2, 1) | (3, 2) => expand.h = true,
                (1, 1) | (2, 2) | (3, 3) => expand.w = true,
                (2, 0) | (3, 0) => expand.c = true,
                (3, 1) => expand.d = true,
                _ => {}
            }
        }
        expand
    }
}

/// Insert a unit axis, returning a view of the input where possible.
///
/// The `expand_*` flags are used if `axes` is empty. Otherwise each entry
/// of `axes` gives the position of a new axis in the output, counting from
/// the outermost. Negative entries count from the innermost. Only one axis
/// is inserted for 2D and 3D inputs.
#[derive(Default)]
pub struct ExpandDims {
    flags: ExpandAxes,
    axes: Vec<i32>,
    state: LayerState,
}

impl ExpandDims {
    pub fn new() -> ExpandDims {
        ExpandDims::default()
    }

    fn expand(&self, input: &Mat) -> Result<Mat, LayerError> {
        let expand = if self.axes.is_empty() {
            self.flags
        } else {
            ExpandAxes::from_axes(&self.axes, input.dims())
        };
        let (w, h, c) = (input.w(), input.h(), input.c());

        let out = match input.dims() {
            1 if expand.w && expand.h => input.reshape_3d(1, w, 1)?,
            1 if expand.w => input.reshape_2d(1, w)?,
            1 if expand.h => input.reshape_2d(w, 1)?,
            2 if expand.w => input.reshape_3d(1, w, h)?,
            2 if expand.h => input.reshape_3d(w, 1, h)?,
            2 if expand.c => input.reshape_3d(w, h, 1)?,
            3 if expand.w => input.reshape_4d(1, w, h, c)?,
            3 if expand.h => input.reshape_4d(w, 1, h, c)?,
            3 if expand.d => input.reshape_4d(w, h, 1, c)?,
            3 if expand.c => input.reshape_4d(w, h, c, 1)?,
            _ => input.clone(),
        };
        Ok(out)
    }
}

impl Layer for ExpandDims {
    fn type_name(&self) -> &'static str {
        "ExpandDims"
    }

    fn load_param(&mut self, params: &ParamDict) -> Result<(), LayerError> {
        self.state.check_not_ready()?;
        self.flags = ExpandAxes {
            w: params.get_int(0, 0) != 0,
            h: params.get_int(1, 0) != 0,
            d: params.get_int(11, 0) != 0,
            c: params.get_int(2, 0) != 0,
        };
        self.axes = params.get_ints(3);
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
        let input = convert_packing(input, 1, &opt.blob_allocator())?;
        let out = self.expand(&input)?;
        Ok([out].into())
    }

    fn destroy_pipeline(&mut self, _opt: &RunOptions) -> Result<(), LayerError> {
        self.state = LayerState::Unconfigured;
        debug!(op = "ExpandDims", "destroyed pipeline");
        Ok(())
    }

    fn state(&self) -> LayerState {
        self.state
    }
}

//! Activation functions, both as fused epilogues for kernels and as
//! standalone elementwise passes.

use crate::kernels::{DType, Storage};
use crate::layer::{match_storage, LayerError};
use crate::mat::Mat;
use crate::threading::parallel_for_each_mut;

/// Activation applied to the output of a layer.
///
/// Layers that support fusing read this from `activation_type` (parameter
/// 9) and `activation_params` (parameter 10).
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub enum Activation {
    #[default]
    Identity,
    Relu,
    LeakyRelu {
        slope: f32,
    },
    Clip {
        min: f32,
        max: f32,
    },
    Sigmoid,
    Mish,
    HardSwish {
        alpha: f32,
        beta: f32,
    },
}

impl Activation {
    /// Decode an activation from its type ID and parameters.
    pub fn from_params(activation_type: i32, params: &[f32]) -> Result<Activation, LayerError> {
        let param = |i: usize| {
            params
                .get(i)
                .copied()
                .ok_or(LayerError::InvalidParam("too few activation params"))
        };
        let act = match activation_type {
            0 => Activation::Identity,
            1 => Activation::Relu,
            2 => Activation::LeakyRelu {
                slope: param(0).unwrap_or(0.),
            },
            3 => Activation::Clip {
                min: param(0)?,
                max: param(1)?,
            },
            4 => Activation::Sigmoid,
            5 => Activation::Mish,
            6 => Activation::HardSwish {
                alpha: param(0)?,
                beta: param(1)?,
            },
            _ => return Err(LayerError::InvalidParam("unknown activation type")),
        };
        Ok(act)
    }

    pub fn is_identity(&self) -> bool {
        *self == Activation::Identity
    }

    #[inline]
    pub fn apply(&self, x: f32) -> f32 {
        match *self {
            Activation::Identity => x,
            Activation::Relu => x.max(0.),
            Activation::LeakyRelu { slope } => {
                if x < 0. {
                    x * slope
                } else {
                    x
                }
            }
            Activation::Clip { min, max } => x.max(min).min(max),
            Activation::Sigmoid => 1. / (1. + (-x).exp()),
            Activation::Mish => x * x.exp().ln_1p().tanh(),
            Activation::HardSwish { alpha, beta } => {
                let lower = -beta / alpha;
                let upper = 1. / alpha + lower;
                if x < lower {
                    0.
                } else if x > upper {
                    x
                } else {
                    x * (x * alpha + beta)
                }
            }
        }
    }

    #[inline]
    pub fn apply_slice(&self, xs: &mut [f32]) {
        if self.is_identity() {
            return;
        }
        for x in xs {
            *x = self.apply(*x);
        }
    }
}

fn map_typed<S: Storage>(
    mat: &mut Mat,
    num_threads: usize,
    f: &(dyn Fn(f32) -> f32 + Sync),
) -> Result<(), LayerError> {
    let chunk = if mat.dims() >= 3 {
        mat.cstep() * mat.elempack()
    } else {
        mat.w() * mat.elempack()
    };
    let data = mat.data_mut::<S>()?;
    parallel_for_each_mut(data, chunk, num_threads, |_, chunk| {
        for x in chunk {
            *x = S::from_f32(f(x.to_f32()));
        }
    });
    Ok(())
}

/// Apply `f` to every element of a uniquely owned tensor stored as `dtype`.
///
/// Channel padding is included, which is harmless for pure functions.
pub(crate) fn map_in_place(
    mat: &mut Mat,
    dtype: DType,
    num_threads: usize,
    f: &(dyn Fn(f32) -> f32 + Sync),
) -> Result<(), LayerError> {
    match_storage!(dtype, S => map_typed::<S>(mat, num_threads, f))
}

/// Apply an activation to a uniquely owned tensor as a separate pass.
pub(crate) fn activate_in_place(
    mat: &mut Mat,
    act: Activation,
    dtype: DType,
    num_threads: usize,
) -> Result<(), LayerError> {
    if act.is_identity() {
        return Ok(());
    }
    map_in_place(mat, dtype, num_threads, &|x| act.apply(x))
}

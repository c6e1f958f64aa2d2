use super::{Isa, IsaId};

/// Portable instruction set, using the scalar implementations provided by
/// the [`Isa`] trait.
///
/// The compiler may still auto-vectorize these loops for the baseline target
/// features.
#[derive(Copy, Clone, Debug, Default)]
pub struct GenericIsa {
    _private: (),
}

impl GenericIsa {
    pub fn new() -> Self {
        GenericIsa { _private: () }
    }
}

impl Isa for GenericIsa {
    fn id(self) -> IsaId {
        IsaId::Scalar
    }
}

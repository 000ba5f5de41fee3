//! Weak tensor handles

use super::Tensor;
use super::core::TensorImpl;
use std::fmt;
use std::sync::Weak;

/// A handle that observes a tensor implementation without keeping it alive
///
/// Created by [`Tensor::downgrade`]. The weak handle of an undefined tensor
/// locks to the undefined tensor.
#[derive(Clone, Default)]
pub struct WeakTensor {
    inner: Option<Weak<TensorImpl>>,
}

impl WeakTensor {
    pub(super) fn new(inner: Option<Weak<TensorImpl>>) -> Self {
        Self { inner }
    }

    /// A strong handle, or `None` once every strong handle is gone
    pub fn lock(&self) -> Option<Tensor> {
        match &self.inner {
            None => Some(Tensor::undefined()),
            Some(weak) => weak.upgrade().map(Tensor::from_arc),
        }
    }

    /// Whether the implementation has been released
    pub fn expired(&self) -> bool {
        self.use_count() == 0 && self.inner.is_some()
    }

    /// Number of strong handles still alive
    pub fn use_count(&self) -> usize {
        self.inner.as_ref().map_or(0, Weak::strong_count)
    }
}

impl fmt::Debug for WeakTensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakTensor")
            .field("use_count", &self.use_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use crate::dispatch::Context;
    use crate::dtype::DType;
    use crate::runtime::Device;
    use crate::tensor::Tensor;

    #[test]
    fn test_lock_while_alive() {
        let ctx = Context::default();
        let t = Tensor::zeros(&ctx, &[2], DType::F32, Device::cpu()).unwrap();
        let weak = t.downgrade();
        assert_eq!(weak.use_count(), 1);
        let locked = weak.lock().unwrap();
        assert!(locked.is_same(&t));
        assert_eq!(t.use_count(), 2);
    }

    #[test]
    fn test_lock_after_release() {
        let ctx = Context::default();
        let t = Tensor::zeros(&ctx, &[2], DType::F32, Device::cpu()).unwrap();
        let weak = t.downgrade();
        drop(t);
        assert!(weak.expired());
        assert!(weak.lock().is_none());
    }

    #[test]
    fn test_weak_of_undefined() {
        let weak = Tensor::undefined().downgrade();
        assert!(!weak.expired());
        assert!(!weak.lock().unwrap().defined());
    }
}

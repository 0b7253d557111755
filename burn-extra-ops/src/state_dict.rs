//! Name-addressed parameter loading.
//!
//! A [`StateDict`] is a flat `name -> tensor` mapping, usually read from a
//! PyTorch checkpoint. Modules walk their own tree with [`LoadStateDict`],
//! pulling the entries that match their parameter names. Entries that no
//! module asks for are left over; parameters without an entry keep their
//! current value. Both lists end up in the [`LoadReport`].

use std::collections::{btree_map::Entry, BTreeMap};
#[cfg(feature = "pretrained")]
use std::path::Path;
use std::path::PathBuf;

use burn::{
    module::{Param, RunningState},
    nn::conv::Conv2d,
    prelude::*,
};
use thiserror::Error;

/// Errors raised while reading or applying a state dict.
#[derive(Error, Debug)]
pub enum StateDictError {
    /// The checkpoint file could not be read or is not a tensor archive.
    #[error("failed to read checkpoint {path}: {reason}")]
    Read {
        /// Checkpoint path.
        path: PathBuf,
        /// Underlying reader message.
        reason: String,
    },

    /// A tensor inside the checkpoint could not be converted.
    #[error("failed to decode tensor '{key}': {reason}")]
    Decode {
        /// Checkpoint key.
        key: String,
        /// Underlying conversion message.
        reason: String,
    },

    /// A checkpoint entry does not have the shape of the parameter it targets.
    #[error("shape mismatch for '{key}': model expects {expected:?}, checkpoint has {actual:?}")]
    ShapeMismatch {
        /// Parameter name.
        key: String,
        /// Shape of the live parameter.
        expected: Vec<usize>,
        /// Shape of the checkpoint entry.
        actual: Vec<usize>,
    },
}

/// Result alias for state dict operations.
pub type StateDictResult<T> = Result<T, StateDictError>;

/// Outcome of applying a [`StateDict`] to a module.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    /// Parameter names that were overwritten from the checkpoint.
    pub loaded: Vec<String>,
    /// Parameter names the checkpoint did not provide.
    pub missing: Vec<String>,
    /// Checkpoint names no parameter asked for, sorted.
    pub unused: Vec<String>,
}

/// Flat mapping from parameter name to tensor data.
#[derive(Debug)]
pub struct StateDict<B: Backend> {
    entries: BTreeMap<String, TensorData>,
    shadowed: Vec<String>,
    loaded: Vec<String>,
    missing: Vec<String>,
    device: Device<B>,
}

impl<B: Backend> StateDict<B> {
    /// Creates an empty state dict whose loaded tensors will live on `device`.
    pub fn new(device: &Device<B>) -> Self {
        Self::from_entries(BTreeMap::new(), device)
    }

    /// Creates a state dict from `(name, data)` pairs. Later duplicates win.
    pub fn from_entries<I>(entries: I, device: &Device<B>) -> Self
    where
        I: IntoIterator<Item = (String, TensorData)>,
    {
        Self {
            entries: entries.into_iter().collect(),
            shadowed: Vec::new(),
            loaded: Vec::new(),
            missing: Vec::new(),
            device: device.clone(),
        }
    }

    /// Reads every tensor of a PyTorch `.pth` archive.
    ///
    /// With `top_level_key`, the archive's top-level dictionary is indexed
    /// with that key first (e.g. `"state_dict"`).
    #[cfg(feature = "pretrained")]
    pub fn from_pytorch_file<P: AsRef<Path>>(
        path: P,
        top_level_key: Option<&str>,
        device: &Device<B>,
    ) -> StateDictResult<Self> {
        use candle_core::DType;

        let path = path.as_ref();
        let tensors = candle_core::pickle::read_all_with_key(path, top_level_key).map_err(
            |err| StateDictError::Read {
                path: path.to_path_buf(),
                reason: err.to_string(),
            },
        )?;

        let mut entries = BTreeMap::new();
        for (key, tensor) in tensors {
            let shape = tensor.dims().to_vec();
            let values = tensor
                .to_dtype(DType::F32)
                .and_then(|t| t.flatten_all())
                .and_then(|t| t.to_vec1::<f32>())
                .map_err(|err| StateDictError::Decode {
                    key: key.clone(),
                    reason: err.to_string(),
                })?;
            entries.insert(key, TensorData::new(values, shape));
        }

        Ok(Self::from_entries(entries, device))
    }

    /// Inserts or replaces an entry.
    pub fn insert(&mut self, key: impl Into<String>, data: TensorData) {
        self.entries.insert(key.into(), data);
    }

    /// Drops the first `len` characters of every key.
    ///
    /// Keys shorter than `len` become empty and can no longer match. When
    /// several keys collapse to the same name, the smallest original key keeps
    /// it; the others are reported as unused under their original name.
    pub fn strip_key_prefix(mut self, len: usize) -> Self {
        if len == 0 {
            return self;
        }
        let entries = std::mem::take(&mut self.entries);
        for (key, data) in entries {
            match self.entries.entry(key.chars().skip(len).collect()) {
                Entry::Vacant(slot) => {
                    slot.insert(data);
                }
                Entry::Occupied(_) => self.shadowed.push(key),
            }
        }
        self
    }

    /// Whether an entry is still available under `key`.
    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Number of entries not yet consumed.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no entries are left.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Replaces `param` with the entry stored under `key`, if any.
    pub fn load_param<const D: usize>(
        &mut self,
        key: &str,
        param: Param<Tensor<B, D>>,
    ) -> StateDictResult<Param<Tensor<B, D>>> {
        let current = param.val();
        let Some(data) = self.take(key, &current.dims())? else {
            return Ok(param);
        };

        let value = Tensor::<B, D>::from_data(data, &self.device)
            .set_require_grad(current.is_require_grad());

        Ok(Param::initialized(param.id, value))
    }

    /// Replaces a running statistic with the entry stored under `key`, if any.
    pub fn load_running<const D: usize>(
        &mut self,
        key: &str,
        state: RunningState<Tensor<B, D>>,
    ) -> StateDictResult<RunningState<Tensor<B, D>>> {
        let current = state.value();
        let Some(data) = self.take(key, &current.dims())? else {
            return Ok(state);
        };

        Ok(RunningState::new(Tensor::from_data(data, &self.device)))
    }

    /// Consumes the state dict and reports what happened.
    pub fn finish(self) -> LoadReport {
        let mut unused: Vec<String> = self.entries.into_keys().chain(self.shadowed).collect();
        unused.sort();

        LoadReport {
            loaded: self.loaded,
            missing: self.missing,
            unused,
        }
    }

    fn take(&mut self, key: &str, expected: &[usize]) -> StateDictResult<Option<TensorData>> {
        let Some(data) = self.entries.get(key) else {
            self.missing.push(key.to_string());
            return Ok(None);
        };

        if data.shape.as_slice() != expected {
            return Err(StateDictError::ShapeMismatch {
                key: key.to_string(),
                expected: expected.to_vec(),
                actual: data.shape.clone(),
            });
        }

        self.loaded.push(key.to_string());
        Ok(self
            .entries
            .remove(key)
            .map(|data| data.convert::<B::FloatElem>()))
    }
}

/// Modules whose parameters can be overwritten by name.
pub trait LoadStateDict<B: Backend>: Sized {
    /// Pulls the entries under `prefix` out of `state` and returns the updated module.
    fn load_state_dict(self, prefix: &str, state: &mut StateDict<B>) -> StateDictResult<Self>;
}

impl<B: Backend> LoadStateDict<B> for Conv2d<B> {
    fn load_state_dict(mut self, prefix: &str, state: &mut StateDict<B>) -> StateDictResult<Self> {
        self.weight = state.load_param(&format!("{prefix}.weight"), self.weight)?;
        self.bias = self
            .bias
            .map(|bias| state.load_param(&format!("{prefix}.bias"), bias))
            .transpose()?;

        Ok(self)
    }
}

impl<B: Backend, M: LoadStateDict<B>> LoadStateDict<B> for Option<M> {
    fn load_state_dict(self, prefix: &str, state: &mut StateDict<B>) -> StateDictResult<Self> {
        self.map(|module| module.load_state_dict(prefix, state))
            .transpose()
    }
}

/// Children are addressed by index, like a PyTorch `Sequential`.
impl<B: Backend, M: LoadStateDict<B>> LoadStateDict<B> for Vec<M> {
    fn load_state_dict(self, prefix: &str, state: &mut StateDict<B>) -> StateDictResult<Self> {
        self.into_iter()
            .enumerate()
            .map(|(index, module)| module.load_state_dict(&format!("{prefix}.{index}"), state))
            .collect()
    }
}

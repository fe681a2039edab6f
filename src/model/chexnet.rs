//! CheXNet: DenseNet-121 with a 14-way sigmoid head, held as field `densenet121`

use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{VarBuilder, VarMap};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};

use super::densenet::{DenseNet, DenseNetConfig};
use crate::error::{Error, Result};

/// Parameter name to tensor, ordered by name
pub type StateDict = BTreeMap<String, Tensor>;

/// Buffers present in newer checkpoints that the model does not track
const IGNORED_SUFFIXES: [&str; 1] = ["num_batches_tracked"];

/// Names listed per category in a mismatch report
const MAX_REPORTED_KEYS: usize = 8;

/// Classifier model whose parameters live in a [`VarMap`]
pub struct ChexNet {
    varmap: VarMap,
    densenet121: DenseNet,
    device: Device,
}

impl ChexNet {
    /// Name of the backbone field in the parameter tree
    pub const BACKBONE: &'static str = "densenet121";

    /// Build a freshly initialized model
    pub fn new(config: &DenseNetConfig, device: &Device) -> Result<Self> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let densenet121 = DenseNet::new(config, vb.pp(Self::BACKBONE))?;

        debug!(
            "Constructed {} with {} classes",
            Self::BACKBONE,
            config.num_classes
        );

        Ok(Self {
            varmap,
            densenet121,
            device: device.clone(),
        })
    }

    /// Backbone hyperparameters
    pub fn config(&self) -> &DenseNetConfig {
        self.densenet121.config()
    }

    /// Shape of every parameter, keyed by its full name
    pub fn parameter_shapes(&self) -> Result<BTreeMap<String, Vec<usize>>> {
        let vars = self
            .varmap
            .data()
            .lock()
            .map_err(|_| Error::internal("parameter store lock poisoned"))?;

        Ok(vars
            .iter()
            .map(|(name, var)| (name.clone(), var.as_tensor().dims().to_vec()))
            .collect())
    }

    /// Load `state` strictly: its key set must equal the parameter set and all shapes must match.
    ///
    /// Every check runs before the first tensor is copied, so a failed load leaves the model untouched.
    pub fn load_state_dict(&self, state: &StateDict) -> Result<usize> {
        let state: BTreeMap<&str, &Tensor> = state
            .iter()
            .filter(|(name, _)| !is_ignored(name))
            .map(|(name, tensor)| (name.as_str(), tensor))
            .collect();

        let vars = self
            .varmap
            .data()
            .lock()
            .map_err(|_| Error::internal("parameter store lock poisoned"))?;

        let expected: BTreeSet<&str> = vars.keys().map(String::as_str).collect();
        let provided: BTreeSet<&str> = state.keys().copied().collect();

        let missing: Vec<&str> = expected.difference(&provided).copied().collect();
        let unexpected: Vec<&str> = provided.difference(&expected).copied().collect();
        let mismatched: Vec<String> = state
            .iter()
            .filter_map(|(name, tensor)| {
                let var = vars.get(*name)?;
                let want = var.as_tensor().dims();
                (want != tensor.dims()).then(|| format!("{} (expected {:?}, got {:?})", name, want, tensor.dims()))
            })
            .collect();

        if !missing.is_empty() || !unexpected.is_empty() || !mismatched.is_empty() {
            let mut problems = Vec::new();
            if !unexpected.is_empty() {
                problems.push(format!("unexpected keys [{}]", summarize(&unexpected)));
            }
            if !missing.is_empty() {
                problems.push(format!("missing keys [{}]", summarize(&missing)));
            }
            if !mismatched.is_empty() {
                problems.push(format!("shape mismatch [{}]", summarize(&mismatched)));
            }
            return Err(Error::state_dict_mismatch(problems.join("; ")));
        }

        for (name, tensor) in &state {
            // Key presence was checked above.
            if let Some(var) = vars.get(*name) {
                var.set(&tensor.to_device(&self.device)?.to_dtype(DType::F32)?)?;
            }
        }

        info!("Loaded {} tensors into {}", state.len(), Self::BACKBONE);
        Ok(state.len())
    }

    /// Initialize the backbone from torchvision-named weights (`features.*`).
    ///
    /// Classifier tensors in `weights` are ignored since the head is replaced.
    pub fn load_backbone_weights(&self, weights: &StateDict) -> Result<usize> {
        let vars = self
            .varmap
            .data()
            .lock()
            .map_err(|_| Error::internal("parameter store lock poisoned"))?;

        let feature_prefix = format!("{}.features.", Self::BACKBONE);
        let mut assignments = Vec::new();
        let mut problems = Vec::new();

        for (name, tensor) in weights {
            if !name.starts_with("features.") || is_ignored(name) {
                continue;
            }
            let full_name = format!("{}.{}", Self::BACKBONE, name);
            match vars.get(&full_name) {
                Some(var) if var.as_tensor().dims() == tensor.dims() => assignments.push((var, tensor)),
                Some(var) => problems.push(format!(
                    "{} (expected {:?}, got {:?})",
                    name,
                    var.as_tensor().dims(),
                    tensor.dims()
                )),
                None => problems.push(format!("{} (not in model)", name)),
            }
        }

        let covered = assignments.len();
        let required = vars.keys().filter(|k| k.starts_with(&feature_prefix)).count();
        if covered != required {
            problems.push(format!("{} of {} backbone tensors provided", covered, required));
        }
        if !problems.is_empty() {
            return Err(Error::state_dict_mismatch(format!(
                "base weights: {}",
                summarize(&problems)
            )));
        }

        for (var, tensor) in assignments {
            var.set(&tensor.to_device(&self.device)?.to_dtype(DType::F32)?)?;
        }

        info!("Initialized backbone from {} base tensors", covered);
        Ok(covered)
    }

    /// Tensors of the backbone submodule with the `densenet121.` prefix removed.
    ///
    /// The classifier head is left out unless `keep_classifier` is set.
    pub fn backbone_state(&self, keep_classifier: bool) -> Result<StateDict> {
        let vars = self
            .varmap
            .data()
            .lock()
            .map_err(|_| Error::internal("parameter store lock poisoned"))?;

        let prefix = format!("{}.", Self::BACKBONE);
        Ok(vars
            .iter()
            .filter_map(|(name, var)| {
                let local = name.strip_prefix(&prefix)?;
                if !keep_classifier && local.starts_with("classifier.") {
                    return None;
                }
                Some((local.to_string(), var.as_tensor().clone()))
            })
            .collect())
    }
}

impl Module for ChexNet {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        self.densenet121.forward(xs)
    }
}

fn is_ignored(name: &str) -> bool {
    IGNORED_SUFFIXES.iter().any(|suffix| name.ends_with(suffix))
}

fn summarize<S: AsRef<str>>(names: &[S]) -> String {
    let shown: Vec<&str> = names.iter().take(MAX_REPORTED_KEYS).map(AsRef::as_ref).collect();
    if names.len() > MAX_REPORTED_KEYS {
        format!("{}, ... ({} more)", shown.join(", "), names.len() - MAX_REPORTED_KEYS)
    } else {
        shown.join(", ")
    }
}

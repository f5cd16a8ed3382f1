// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of VisPred — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Parameter snapshots in JSON or bincode.

use crate::module::Parameterized;
use crate::{PureResult, Tensor, TensorError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;
use tracing::debug;

const SNAPSHOT_VERSION: u32 = 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SnapshotFormat {
    Json,
    Bincode,
}

impl SnapshotFormat {
    /// `.json` selects JSON; anything else is bincode.
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("json") => SnapshotFormat::Json,
            _ => SnapshotFormat::Bincode,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct StoredTensor {
    rows: usize,
    cols: usize,
    data: Vec<f32>,
}

impl StoredTensor {
    fn from_tensor(tensor: &Tensor) -> StoredTensor {
        let (rows, cols) = tensor.shape();
        StoredTensor {
            rows,
            cols,
            data: tensor.data().to_vec(),
        }
    }

    fn into_tensor(self) -> PureResult<Tensor> {
        Tensor::from_vec(self.rows, self.cols, self.data)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct Snapshot {
    version: u32,
    parameters: BTreeMap<String, StoredTensor>,
}

impl Snapshot {
    fn from_state(state: &HashMap<String, Tensor>) -> Self {
        Snapshot {
            version: SNAPSHOT_VERSION,
            parameters: state
                .iter()
                .map(|(name, tensor)| (name.clone(), StoredTensor::from_tensor(tensor)))
                .collect(),
        }
    }

    fn into_state(self) -> PureResult<HashMap<String, Tensor>> {
        if self.version != SNAPSHOT_VERSION {
            return Err(TensorError::SerializationError {
                message: format!(
                    "unsupported snapshot version {} (expected {SNAPSHOT_VERSION})",
                    self.version
                ),
            });
        }
        self.parameters
            .into_iter()
            .map(|(name, tensor)| Ok((name, tensor.into_tensor()?)))
            .collect()
    }
}

fn io_error(err: std::io::Error) -> TensorError {
    TensorError::IoError {
        message: err.to_string(),
    }
}

fn serde_error(err: impl ToString) -> TensorError {
    TensorError::SerializationError {
        message: err.to_string(),
    }
}

pub fn save_state_dict<P: AsRef<Path>>(
    state: &HashMap<String, Tensor>,
    path: P,
    format: SnapshotFormat,
) -> PureResult<()> {
    let snapshot = Snapshot::from_state(state);
    let file = File::create(path.as_ref()).map_err(io_error)?;
    let writer = BufWriter::new(file);
    match format {
        SnapshotFormat::Json => serde_json::to_writer_pretty(writer, &snapshot).map_err(serde_error)?,
        SnapshotFormat::Bincode => bincode::serialize_into(writer, &snapshot).map_err(serde_error)?,
    }
    debug!(
        path = %path.as_ref().display(),
        parameters = snapshot.parameters.len(),
        ?format,
        "saved parameter snapshot"
    );
    Ok(())
}

pub fn load_state_dict<P: AsRef<Path>>(
    path: P,
    format: SnapshotFormat,
) -> PureResult<HashMap<String, Tensor>> {
    let file = File::open(path.as_ref()).map_err(io_error)?;
    let reader = BufReader::new(file);
    let snapshot: Snapshot = match format {
        SnapshotFormat::Json => serde_json::from_reader(reader).map_err(serde_error)?,
        SnapshotFormat::Bincode => bincode::deserialize_from(reader).map_err(serde_error)?,
    };
    snapshot.into_state()
}

/// Writes every parameter of `module`; the format follows the file extension.
pub fn save<M: Parameterized + ?Sized, P: AsRef<Path>>(module: &M, path: P) -> PureResult<()> {
    let format = SnapshotFormat::from_path(path.as_ref());
    save_state_dict(&module.state_dict()?, path, format)
}

/// Restores every parameter of `module`; missing names fail with `MissingParameter`.
pub fn load<M: Parameterized + ?Sized, P: AsRef<Path>>(module: &mut M, path: P) -> PureResult<()> {
    let format = SnapshotFormat::from_path(path.as_ref());
    let state = load_state_dict(path, format)?;
    module.load_state_dict(&state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModulatorConfig;
    use crate::modulator::HistoryStateGainModulator;
    use std::fs;
    use tempfile::tempdir;

    fn modulator() -> HistoryStateGainModulator {
        let config = ModulatorConfig {
            include_gain: true,
            per_neuron_gain_adjust: true,
            ..ModulatorConfig::default()
        };
        HistoryStateGainModulator::new("m", 4, 7, &config, Some(11)).unwrap()
    }

    #[test]
    fn json_snapshot_restores_parameters() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("modulator.json");
        let mut module = modulator();
        save(&module, &path).unwrap();
        let before = module.state_dict().unwrap();

        module
            .visit_parameters_mut(&mut |p| p.accumulate_euclidean(&p.value().clone()))
            .unwrap();
        module.apply_step(0.5).unwrap();
        assert_ne!(before, module.state_dict().unwrap());

        load(&mut module, &path).unwrap();
        assert_eq!(before, module.state_dict().unwrap());
        let text = fs::read_to_string(&path).unwrap();
        assert!(text.contains("m::own_gain"));
    }

    #[test]
    fn bincode_snapshot_restores_parameters() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("modulator.bin");
        let module = modulator();
        save(&module, &path).unwrap();
        let state = load_state_dict(&path, SnapshotFormat::Bincode).unwrap();
        assert_eq!(state, module.state_dict().unwrap());
    }

    #[test]
    fn loading_into_a_larger_module_reports_missing_parameter() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("small.json");
        let small =
            HistoryStateGainModulator::new("m", 4, 7, &ModulatorConfig::default(), Some(1))
                .unwrap();
        save(&small, &path).unwrap();
        let mut large = modulator();
        assert!(matches!(
            load(&mut large, &path),
            Err(TensorError::MissingParameter { .. })
        ));
    }
}

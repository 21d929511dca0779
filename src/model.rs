//! Model artifact contract (§3/§6). Model *loading* is an external
//! collaborator — the core only consumes already-materialized handles. The
//! `PyModelHandle` here is one concrete adapter (joblib/sklearn via PyO3),
//! but `Detector`/`Ensemble` only ever depend on the `ModelHandle` trait.

use std::collections::HashMap;

use pyo3::prelude::*;
use pyo3::types::PyList;

use crate::error::{DDoSError, Result};
use crate::features::Schema;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelKind {
    CicDdos,
    Suricata,
}

impl ModelKind {
    pub fn schema(&self) -> Schema {
        match self {
            ModelKind::CicDdos => Schema::CicDdos,
            ModelKind::Suricata => Schema::Suricata,
        }
    }
}

pub trait Scaler: Send + Sync {
    fn expected_feature_count(&self) -> usize;
    fn transform(&self, vector: &[f64]) -> Result<Vec<f64>>;
}

/// External model contract (§3, "ModelHandle"): `predict_proba`, a declared
/// feature-name list, an optional scaler, a label map, a model-kind tag and
/// a fusion weight.
pub trait ModelHandle: Send + Sync {
    fn feature_names(&self) -> &[String];
    fn scaler(&self) -> Option<&dyn Scaler>;
    /// Row-major `matrix[M x F]` in, `matrix[M x K]` of class
    /// probabilities out.
    fn predict_proba(&self, matrix: &[Vec<f64>]) -> Result<Vec<Vec<f64>>>;
    fn label_map(&self) -> &HashMap<usize, String>;
    fn model_kind(&self) -> ModelKind;
    fn weight(&self) -> f64;
}

/// joblib-persisted sklearn `StandardScaler` (or equivalent) reached
/// through PyO3.
pub struct JoblibScaler {
    scaler: PyObject,
    expected_feature_count: usize,
}

impl Scaler for JoblibScaler {
    fn expected_feature_count(&self) -> usize {
        self.expected_feature_count
    }

    fn transform(&self, vector: &[f64]) -> Result<Vec<f64>> {
        Python::with_gil(|py| {
            let row = PyList::new(py, vector)
                .map_err(|e| DDoSError::ModelExecutionFailure(e.to_string()))?;
            let rows = PyList::new(py, [row])
                .map_err(|e| DDoSError::ModelExecutionFailure(e.to_string()))?;
            let transformed = self
                .scaler
                .bind(py)
                .call_method1("transform", (rows,))
                .map_err(|e| DDoSError::ModelExecutionFailure(e.to_string()))?;
            let first_row = transformed
                .get_item(0)
                .map_err(|e| DDoSError::ModelExecutionFailure(e.to_string()))?;
            first_row
                .extract::<Vec<f64>>()
                .map_err(|e| DDoSError::ModelExecutionFailure(e.to_string()))
        })
    }
}

/// sklearn-compatible estimator reached through PyO3: `joblib.load` handed
/// a `.pkl` path, then `predict_proba` per scoring call.
pub struct PyModelHandle {
    model: PyObject,
    scaler: Option<JoblibScaler>,
    feature_names: Vec<String>,
    label_map: HashMap<usize, String>,
    model_kind: ModelKind,
    weight: f64,
}

impl PyModelHandle {
    pub fn load(
        model_path: &str,
        scaler_path: Option<&str>,
        feature_names: Vec<String>,
        label_map: HashMap<usize, String>,
        model_kind: ModelKind,
        weight: f64,
    ) -> Result<Self> {
        Python::with_gil(|py| {
            let joblib = py
                .import("joblib")
                .map_err(|e| DDoSError::ModelError(e.to_string()))?;
            let model = joblib
                .call_method1("load", (model_path,))
                .map_err(|e| DDoSError::ModelError(e.to_string()))?
                .unbind();

            let scaler = match scaler_path {
                Some(path) => {
                    let scaler_obj = joblib
                        .call_method1("load", (path,))
                        .map_err(|e| DDoSError::ModelError(e.to_string()))?
                        .unbind();
                    Some(JoblibScaler {
                        scaler: scaler_obj,
                        expected_feature_count: feature_names.len(),
                    })
                }
                None => None,
            };

            Ok(Self { model, scaler, feature_names, label_map, model_kind, weight })
        })
    }
}

impl ModelHandle for PyModelHandle {
    fn feature_names(&self) -> &[String] {
        &self.feature_names
    }

    fn scaler(&self) -> Option<&dyn Scaler> {
        self.scaler.as_ref().map(|s| s as &dyn Scaler)
    }

    fn predict_proba(&self, matrix: &[Vec<f64>]) -> Result<Vec<Vec<f64>>> {
        Python::with_gil(|py| {
            let rows: Vec<Bound<PyList>> = matrix
                .iter()
                .map(|row| PyList::new(py, row))
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| DDoSError::ModelExecutionFailure(e.to_string()))?;
            let py_matrix = PyList::new(py, rows)
                .map_err(|e| DDoSError::ModelExecutionFailure(e.to_string()))?;
            let result = self
                .model
                .bind(py)
                .call_method1("predict_proba", (py_matrix,))
                .map_err(|e| DDoSError::ModelExecutionFailure(e.to_string()))?;
            result
                .extract::<Vec<Vec<f64>>>()
                .map_err(|e| DDoSError::ModelExecutionFailure(e.to_string()))
        })
    }

    fn label_map(&self) -> &HashMap<usize, String> {
        &self.label_map
    }

    fn model_kind(&self) -> ModelKind {
        self.model_kind
    }

    fn weight(&self) -> f64 {
        self.weight
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StubScaler {
        expected: usize,
    }

    impl Scaler for StubScaler {
        fn expected_feature_count(&self) -> usize {
            self.expected
        }
        fn transform(&self, vector: &[f64]) -> Result<Vec<f64>> {
            Ok(vector.iter().map(|v| v * 2.0).collect())
        }
    }

    #[test]
    fn scaler_bypassed_when_feature_count_mismatches() {
        let scaler = StubScaler { expected: 8 };
        assert_eq!(scaler.expected_feature_count(), 8);
        let vector = vec![1.0, 2.0, 3.0];
        assert_ne!(vector.len(), scaler.expected_feature_count());
    }
}

//! Classifier Ensemble (C3): scores a flow against each configured model,
//! then fuses the per-model results into one `Verdict` under a configured
//! policy (§4.3).

use std::collections::HashMap;

use log::debug;

use crate::config::CombinationMethod;
use crate::error::Result;
use crate::features::{extract, materialize, Schema};
use crate::flow::Flow;
use crate::model::{ModelHandle, ModelKind};

/// Canonical display-name translation applied to every raw class label
/// before fusion (§4.3 step 4).
pub fn canonical_display_name(raw: &str, overrides: &HashMap<String, String>) -> String {
    if let Some(mapped) = overrides.get(raw) {
        return mapped.clone();
    }
    raw.to_string()
}

#[derive(Debug, Clone)]
pub struct PerModelResult {
    pub model_kind: ModelKind,
    pub weight: f64,
    pub is_attack: bool,
    pub confidence: f64,
    pub attack_type: String,
}

#[derive(Debug, Clone)]
pub struct Verdict {
    pub is_attack: bool,
    pub confidence: f64,
    pub attack_type: String,
    pub per_model_results: Vec<PerModelResult>,
    pub missing_feature_names: Vec<String>,
}

/// Scores a single model against a flow: materializes the schema vector,
/// scales it when the feature count matches, calls `predict_proba`, and
/// applies the canonical display-name mapping plus the Suricata override
/// (§4.2 step 3, §4.3 steps 1-5).
fn score_model(
    flow: &Flow,
    handle: &dyn ModelHandle,
    detection_threshold: f64,
    attack_type_overrides: &HashMap<String, String>,
) -> Result<(PerModelResult, Vec<String>)> {
    let schema = handle.model_kind().schema();
    let raw_map = extract(flow, schema);
    let present_names: Vec<String> = raw_map.keys().cloned().collect();
    let missing: Vec<String> = handle
        .feature_names()
        .iter()
        .filter(|n| !present_names.contains(n))
        .cloned()
        .collect();

    let vector = materialize(&raw_map, handle.feature_names());

    let vector = match handle.scaler() {
        Some(scaler) if scaler.expected_feature_count() == vector.len() => scaler.transform(&vector)?,
        Some(scaler) => {
            debug!(
                "feature count mismatch: expected {}, got {}; bypassing scaler",
                scaler.expected_feature_count(),
                vector.len()
            );
            vector
        }
        None => vector,
    };

    let proba = match handle.predict_proba(&[vector]) {
        Ok(rows) => rows.into_iter().next().unwrap_or_default(),
        Err(_) => {
            return Ok((
                PerModelResult {
                    model_kind: handle.model_kind(),
                    weight: handle.weight(),
                    is_attack: false,
                    confidence: 0.0,
                    attack_type: "Unknown".to_string(),
                },
                missing,
            ));
        }
    };

    let (class_idx, confidence) = argmax(&proba);
    let raw_label = handle
        .label_map()
        .get(&class_idx)
        .cloned()
        .unwrap_or_else(|| "Unknown".to_string());
    let display_name = canonical_display_name(&raw_label, attack_type_overrides);

    let mut is_attack = display_name != "Normal";
    let mut attack_type = display_name;
    if handle.model_kind() == ModelKind::Suricata {
        is_attack = confidence >= detection_threshold;
        attack_type = if is_attack { "Generic DDoS".to_string() } else { "Normal".to_string() };
    }

    Ok((
        PerModelResult { model_kind: handle.model_kind(), weight: handle.weight(), is_attack, confidence, attack_type },
        missing,
    ))
}

fn argmax(proba: &[f64]) -> (usize, f64) {
    let mut best_idx = 0;
    let mut best_val = f64::MIN;
    for (i, &v) in proba.iter().enumerate() {
        if v > best_val {
            best_val = v;
            best_idx = i;
        }
    }
    (best_idx, best_val.max(0.0))
}

/// Normalizes weights to sum to 1; short lists repeat their last entry;
/// an all-zero sum yields uniform weights (§4.3).
pub fn normalize_weights(model_count: usize, configured: &[f64]) -> Vec<f64> {
    if model_count == 0 {
        return Vec::new();
    }
    let mut weights: Vec<f64> = (0..model_count)
        .map(|i| configured.get(i).copied().unwrap_or_else(|| *configured.last().unwrap_or(&1.0)))
        .collect();
    let sum: f64 = weights.iter().sum();
    if sum <= 0.0 {
        let uniform = 1.0 / model_count as f64;
        weights.iter_mut().for_each(|w| *w = uniform);
    } else {
        weights.iter_mut().for_each(|w| *w /= sum);
    }
    weights
}

/// Scores every configured model against a flow and fuses the results
/// under `method` (§4.3).
pub fn classify(
    flow: &Flow,
    models: &[Box<dyn ModelHandle>],
    configured_weights: &[f64],
    method: CombinationMethod,
    detection_threshold: f64,
    attack_type_overrides: &HashMap<String, String>,
) -> Verdict {
    let weights = normalize_weights(models.len(), configured_weights);
    let mut results = Vec::with_capacity(models.len());
    let mut missing_all = Vec::new();

    for (handle, weight) in models.iter().zip(weights.iter()) {
        match score_model(flow, handle.as_ref(), detection_threshold, attack_type_overrides) {
            Ok((mut result, missing)) => {
                result.weight = *weight;
                results.push(result);
                missing_all.extend(missing);
            }
            Err(_) => {
                results.push(PerModelResult {
                    model_kind: handle.model_kind(),
                    weight: *weight,
                    is_attack: false,
                    confidence: 0.0,
                    attack_type: "Unknown".to_string(),
                });
            }
        }
    }

    let (is_attack, confidence, attack_type) = fuse(&results, method);

    Verdict { is_attack, confidence, attack_type, per_model_results: results, missing_feature_names: missing_all }
}

fn fuse(results: &[PerModelResult], method: CombinationMethod) -> (bool, f64, String) {
    if results.is_empty() {
        return (false, 0.0, "Normal".to_string());
    }
    match method {
        CombinationMethod::MaxConfidence => fuse_max_confidence(results),
        CombinationMethod::Weighted => fuse_weighted(results),
        CombinationMethod::Voting => fuse_voting(results),
    }
}

fn fuse_max_confidence(results: &[PerModelResult]) -> (bool, f64, String) {
    let winner_idx = results
        .iter()
        .enumerate()
        .map(|(i, r)| (i, r.confidence * r.weight))
        .fold((0usize, f64::MIN), |best, cur| if cur.1 > best.1 { cur } else { best })
        .0;
    let winner = &results[winner_idx];

    let mut attack_type = winner.attack_type.clone();
    if winner.model_kind == ModelKind::Suricata {
        if let Some(cic) = results
            .iter()
            .find(|r| r.model_kind == ModelKind::CicDdos && r.is_attack)
        {
            attack_type = cic.attack_type.clone();
        }
    }

    (winner.is_attack, winner.confidence, attack_type)
}

fn fuse_weighted(results: &[PerModelResult]) -> (bool, f64, String) {
    let sum: f64 = results
        .iter()
        .map(|r| {
            let adjusted = if r.is_attack { r.confidence } else { -r.confidence };
            adjusted * r.weight
        })
        .sum();
    let is_attack = sum > 0.0;
    let confidence = sum.abs().min(1.0);

    let attack_type = if is_attack {
        results
            .iter()
            .find(|r| r.model_kind == ModelKind::CicDdos && r.is_attack)
            .map(|r| r.attack_type.clone())
            .or_else(|| {
                results
                    .iter()
                    .filter(|r| r.is_attack)
                    .max_by(|a, b| a.confidence.partial_cmp(&b.confidence).unwrap())
                    .map(|r| r.attack_type.clone())
            })
            .unwrap_or_else(|| "Generic DDoS".to_string())
    } else {
        "Normal".to_string()
    };

    (is_attack, confidence, attack_type)
}

fn fuse_voting(results: &[PerModelResult]) -> (bool, f64, String) {
    let attack_weight: f64 = results.iter().filter(|r| r.is_attack).map(|r| r.weight).sum();
    let is_attack = attack_weight > 0.5;
    let confidence: f64 = results.iter().map(|r| r.confidence * r.weight).sum();

    let mut tally: Vec<(String, f64)> = Vec::new();
    for r in results {
        if let Some(entry) = tally.iter_mut().find(|(name, _)| *name == r.attack_type) {
            entry.1 += r.weight;
        } else {
            tally.push((r.attack_type.clone(), r.weight));
        }
    }
    let attack_type = tally
        .into_iter()
        .fold(None, |best: Option<(String, f64)>, cur| match &best {
            Some(b) if b.1 >= cur.1 => best,
            _ => Some(cur),
        })
        .map(|(name, _)| name)
        .unwrap_or_else(|| "Normal".to_string());

    (is_attack, confidence, attack_type)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(kind: ModelKind, weight: f64, is_attack: bool, confidence: f64, attack_type: &str) -> PerModelResult {
        PerModelResult { model_kind: kind, weight, is_attack, confidence, attack_type: attack_type.to_string() }
    }

    #[test]
    fn max_confidence_with_single_model_equals_that_models_verdict() {
        let r = result(ModelKind::CicDdos, 1.0, true, 0.95, "SYN Flood");
        let (is_attack, confidence, attack_type) = fuse(&[r], CombinationMethod::MaxConfidence);
        assert!(is_attack);
        assert_eq!(confidence, 0.95);
        assert_eq!(attack_type, "SYN Flood");
    }

    #[test]
    fn weighted_fusion_matches_model_disagreement_scenario() {
        let a = result(ModelKind::CicDdos, 0.6, true, 0.8, "UDP Flood");
        let b = result(ModelKind::Suricata, 0.4, false, 0.9, "Normal");
        let (is_attack, confidence, attack_type) = fuse(&[a, b], CombinationMethod::Weighted);
        assert!(is_attack);
        assert!((confidence - 0.12).abs() < 1e-9);
        assert_eq!(attack_type, "UDP Flood");
    }

    #[test]
    fn voting_requires_majority_weight() {
        let a = result(ModelKind::CicDdos, 0.5, true, 0.9, "SYN Flood");
        let b = result(ModelKind::Suricata, 0.5, false, 0.9, "Normal");
        let (is_attack, _, _) = fuse(&[a, b], CombinationMethod::Voting);
        assert!(!is_attack, "tie at exactly 0.5 weight does not exceed the 0.5 threshold");
    }

    #[test]
    fn max_confidence_suricata_winner_inherits_cic_ddos_attack_type() {
        let cic = result(ModelKind::CicDdos, 0.3, true, 0.5, "MSSQL Amplification");
        let suricata = result(ModelKind::Suricata, 0.7, true, 0.9, "Generic DDoS");
        let (is_attack, _, attack_type) = fuse(&[cic, suricata], CombinationMethod::MaxConfidence);
        assert!(is_attack);
        assert_eq!(attack_type, "MSSQL Amplification");
    }

    #[test]
    fn weight_normalization_repeats_last_weight_and_handles_zero_sum() {
        let w = normalize_weights(3, &[0.6]);
        assert_eq!(w.len(), 3);
        assert!((w.iter().sum::<f64>() - 1.0).abs() < 1e-9);

        let w0 = normalize_weights(2, &[0.0, 0.0]);
        assert_eq!(w0, vec![0.5, 0.5]);
    }
}

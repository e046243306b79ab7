//! Per-scan and per-domain Dice aggregation

use std::collections::BTreeMap;

use candle_core::Tensor;
use ndarray::{s, Array2, Axis};
use serde::Serialize;
use tracing::{info, instrument};

use super::dice::{mean_dice, one_hot_classes};
use super::volume::ScanPrediction;
use crate::error::{Error, Result};

/// Split `<domain>_<patient>`; anything but exactly one `_` is rejected
pub fn split_scan_id(scan_id: &str) -> Result<(&str, &str)> {
    let mut parts = scan_id.split('_');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(domain), Some(patient), None) => Ok((domain, patient)),
        _ => Err(Error::ScanIdParse {
            scan_id: scan_id.to_string(),
        }),
    }
}

/// Dice of every class, background included, over a whole `[nframe, H, W]`
/// volume
pub fn volume_dice(pred: &Tensor, gth: &Tensor, num_classes: usize) -> Result<Vec<f64>> {
    let pred = one_hot_classes(&pred.unsqueeze(0)?, num_classes)?;
    let gth = one_hot_classes(&gth.unsqueeze(0)?, num_classes)?;
    let scores = mean_dice(&pred, &gth, true)?;
    Ok(scores.row(0).to_vec())
}

/// Mean and population standard deviation of one class
#[derive(Debug, Clone, Serialize)]
pub struct ClassStat {
    pub label: String,
    pub mean: f64,
    pub std: f64,
}

/// Scores of the scans belonging to one domain
#[derive(Debug, Clone, Serialize)]
pub struct DomainSummary {
    pub name: String,
    /// Mean over the domain's rows, background excluded
    pub overall: f64,
    /// Rows of the domain, one per scan
    pub table: Array2<f64>,
    pub scan_ids: Vec<String>,
}

/// Result of one volumetric evaluation
#[derive(Debug, Clone, Serialize)]
pub struct EvalReport {
    /// Free-form tag of the evaluation setting
    pub mode: String,
    pub per_class: Vec<ClassStat>,
    pub overall: f64,
    pub overall_std: f64,
    /// Domains in order of first appearance
    pub domains: Vec<DomainSummary>,
    /// Unweighted mean of the per-domain means
    pub overall_by_domain: f64,
    /// `[num_scans, num_classes]` Dice, background in column 0
    pub dsc_table: Array2<f64>,
}

impl EvalReport {
    /// Scalar entries keyed the way they are logged
    pub fn summary_map(&self) -> BTreeMap<String, f64> {
        let mut map = BTreeMap::new();
        for stat in &self.per_class {
            map.insert(stat.label.clone(), stat.mean);
        }
        map.insert("overall".to_string(), self.overall);
        map.insert("overall_std".to_string(), self.overall_std);
        for domain in &self.domains {
            map.insert(format!("domain_{}_overall", domain.name), domain.overall);
        }
        map.insert("overall_by_domain".to_string(), self.overall_by_domain);
        map
    }

    /// Names of the evaluated domains
    pub fn domain_names(&self) -> Vec<String> {
        self.domains.iter().map(|d| d.name.clone()).collect()
    }
}

fn mean_or_nan(values: ndarray::ArrayView2<'_, f64>) -> f64 {
    values.mean().unwrap_or(f64::NAN)
}

/// Score every scan and aggregate per class, overall and per domain
///
/// Means here propagate NaN: a scan missing a class poisons that class
/// column and every aggregate that includes it.
#[instrument(skip_all, fields(scans = volumes.len()))]
pub fn eval_list(volumes: &[(String, ScanPrediction)], label_names: &[String]) -> Result<EvalReport> {
    if volumes.is_empty() {
        return Err(Error::scan_state("no finalized scans to evaluate"));
    }
    let num_classes = label_names.len();
    if num_classes < 2 {
        return Err(Error::config("evaluation needs a background and at least one foreground label"));
    }

    let mut flat = Vec::with_capacity(volumes.len() * num_classes);
    let mut domain_rows: Vec<(String, Vec<usize>)> = Vec::new();
    for (row, (scan_id, scan)) in volumes.iter().enumerate() {
        let (domain, _patient) = split_scan_id(scan_id)?;
        flat.extend(volume_dice(&scan.pred, &scan.gth, num_classes)?);

        match domain_rows.iter_mut().find(|(name, _)| name == domain) {
            Some((_, rows)) => rows.push(row),
            None => domain_rows.push((domain.to_string(), vec![row])),
        }
    }
    let dsc_table = Array2::from_shape_vec((volumes.len(), num_classes), flat)
        .map_err(|e| Error::training(e.to_string()))?;

    let means = dsc_table.mean_axis(Axis(0)).ok_or_else(|| Error::training("empty Dice table"))?;
    let stds = dsc_table.std_axis(Axis(0), 0.0);
    let per_class: Vec<ClassStat> = label_names
        .iter()
        .enumerate()
        .map(|(k, label)| {
            info!("{} : {:.4} ± {:.4}", label, means[k], stds[k]);
            ClassStat {
                label: label.clone(),
                mean: means[k],
                std: stds[k],
            }
        })
        .collect();

    let foreground = dsc_table.slice(s![.., 1..]);
    let overall = mean_or_nan(foreground);
    let overall_std = foreground.std(0.0);
    info!("Overall : {:.4} ± {:.4}", overall, overall_std);

    let domains: Vec<DomainSummary> = domain_rows
        .into_iter()
        .map(|(name, rows)| {
            let table = dsc_table.select(Axis(0), &rows);
            let overall = mean_or_nan(table.slice(s![.., 1..]));
            info!("Domain {} ({} scans) overall : {:.4}", name, rows.len(), overall);
            DomainSummary {
                scan_ids: rows.iter().map(|&r| volumes[r].0.clone()).collect(),
                name,
                overall,
                table,
            }
        })
        .collect();

    let overall_by_domain = domains.iter().map(|d| d.overall).sum::<f64>() / domains.len() as f64;
    info!("Overall by domain : {:.4}", overall_by_domain);

    Ok(EvalReport {
        mode: String::new(),
        per_class,
        overall,
        overall_std,
        domains,
        overall_by_domain,
        dsc_table,
    })
}

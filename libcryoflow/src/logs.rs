//! Parsing of the per-micrograph text outputs of the CTF estimators and particle picker,
//! and the summary statistics built from them.
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use super::config::CtfEstimator;
use super::constants::{ESTIMATE_AGREEMENT, UNRESOLVED_RESOLUTION, VALIDATION_BINS};
use super::error::LogParseError;
use super::glob::glob_match;

const GCTF_LOG_SUFFIX: &str = "_gctf.log";
const CTFFIND_TXT_SUFFIX: &str = ".txt";

/// CTF fit of a single micrograph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CtfRecord {
    /// Micrograph name without extension
    pub micrograph: String,
    pub defocus_u: f64,
    pub defocus_v: f64,
    pub angle: f64,
    pub cc: f64,
    /// Angstrom
    pub resolution: f64,
    /// Gctf validation scores by resolution bin; empty for ctffind
    #[serde(default)]
    pub validation: Vec<(String, f64)>,
}

/// Count and column means of a set of CTF fits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CtfSummary {
    pub count: usize,
    pub mean_defocus_u: f64,
    pub mean_defocus_v: f64,
    pub mean_angle: f64,
    pub mean_cc: f64,
    pub mean_resolution: f64,
}

impl CtfSummary {
    /// Means are rounded to one decimal place
    pub fn from_records(records: &[CtfRecord]) -> Result<Self, LogParseError> {
        if records.is_empty() {
            return Err(LogParseError::NoResults);
        }
        let mean = |f: fn(&CtfRecord) -> f64| {
            round_to_tenth(records.iter().map(f).sum::<f64>() / records.len() as f64)
        };
        Ok(Self {
            count: records.len(),
            mean_defocus_u: mean(|r| r.defocus_u),
            mean_defocus_v: mean(|r| r.defocus_v),
            mean_angle: mean(|r| r.angle),
            mean_cc: mean(|r| r.cc),
            mean_resolution: mean(|r| r.resolution),
        })
    }
}

fn round_to_tenth(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

/// Parser for Gctf per-micrograph logs (`<name>_gctf.log`)
#[derive(Debug, Clone)]
pub struct GctfLogParser {
    final_values: Regex,
    res_limit: Regex,
    validation: Regex,
}

impl GctfLogParser {
    pub fn new() -> Result<Self, LogParseError> {
        let bins = VALIDATION_BINS.join("|");
        Ok(Self {
            final_values: Regex::new(r"^\s*(\S+)\s+(\S+)\s+(\S+)\s+(\S+)\s+Final Values")?,
            res_limit: Regex::new(r"RES_LIMIT\s+(\S+)\s*$")?,
            validation: Regex::new(&format!(r"^\s*({bins})\s.*\s(\S+)\s*$"))?,
        })
    }

    pub fn parse_file(&self, path: &Path) -> Result<CtfRecord, LogParseError> {
        let text = read(path)?;
        let name = file_name(path);
        let micrograph = name.strip_suffix(GCTF_LOG_SUFFIX).unwrap_or(&name);
        self.parse(path, micrograph, &text)
    }

    pub fn parse(
        &self,
        path: &Path,
        micrograph: &str,
        text: &str,
    ) -> Result<CtfRecord, LogParseError> {
        let mut fit: Option<[f64; 4]> = None;
        let mut resolution: Option<f64> = None;
        let mut validation = Vec::new();

        for line in text.lines() {
            if let Some(caps) = self.final_values.captures(line) {
                let mut values = [0.0; 4];
                for (idx, value) in values.iter_mut().enumerate() {
                    *value = parse_value(path, "Final Values", line, &caps[idx + 1])?;
                }
                fit = Some(values);
            } else if let Some(caps) = self.res_limit.captures(line) {
                resolution = Some(parse_value(path, "RES_LIMIT", line, &caps[1])?);
            } else if let Some(caps) = self.validation.captures(line) {
                let score = parse_value(path, "Validation scores", line, &caps[2])?;
                validation.push((caps[1].to_string(), score));
            }
        }

        let [defocus_u, defocus_v, angle, cc] = fit.ok_or(LogParseError::MissingEntry {
            path: path.to_path_buf(),
            marker: "Final Values",
        })?;
        let resolution = resolution.ok_or(LogParseError::MissingEntry {
            path: path.to_path_buf(),
            marker: "RES_LIMIT",
        })?;
        Ok(CtfRecord {
            micrograph: micrograph.to_string(),
            defocus_u,
            defocus_v,
            angle,
            cc,
            resolution,
            validation,
        })
    }
}

/// Parse a ctffind output summary (`<name>.txt`). The last line holds the fit; columns 1, 2, 3,
/// 5 and 6 are defocus U, defocus V, angle, cross correlation and fitted resolution.
pub fn parse_ctffind_txt(path: &Path) -> Result<CtfRecord, LogParseError> {
    let text = read(path)?;
    let name = file_name(path);
    let micrograph = name.strip_suffix(CTFFIND_TXT_SUFFIX).unwrap_or(&name);
    parse_ctffind_text(path, micrograph, &text)
}

fn parse_ctffind_text(path: &Path, micrograph: &str, text: &str) -> Result<CtfRecord, LogParseError> {
    const MARKER: &str = "ctffind result";
    let line = text
        .lines()
        .rev()
        .find(|l| !l.trim().is_empty() && !l.trim_start().starts_with('#'))
        .ok_or(LogParseError::MissingEntry {
            path: path.to_path_buf(),
            marker: MARKER,
        })?;
    let columns: Vec<&str> = line.split_whitespace().collect();
    if columns.len() < 7 {
        return Err(LogParseError::Malformed {
            path: path.to_path_buf(),
            marker: MARKER,
            line: line.to_string(),
        });
    }
    let resolution = if columns[6] == "inf" {
        UNRESOLVED_RESOLUTION
    } else {
        parse_value(path, MARKER, line, columns[6])?
    };
    Ok(CtfRecord {
        micrograph: micrograph.to_string(),
        defocus_u: parse_value(path, MARKER, line, columns[1])?,
        defocus_v: parse_value(path, MARKER, line, columns[2])?,
        angle: parse_value(path, MARKER, line, columns[3])?,
        cc: parse_value(path, MARKER, line, columns[5])?,
        resolution,
        validation: Vec::new(),
    })
}

/// Parse every result of the given estimator found in `dir`, sorted by micrograph name
pub fn collect_ctf_results(
    dir: &Path,
    estimator: CtfEstimator,
) -> Result<Vec<CtfRecord>, LogParseError> {
    let mut records = match estimator {
        CtfEstimator::Gctf => {
            let parser = GctfLogParser::new()?;
            list_matching(dir, &format!("*{GCTF_LOG_SUFFIX}"))?
                .iter()
                .map(|path| parser.parse_file(path))
                .collect::<Result<Vec<_>, _>>()?
        }
        CtfEstimator::Ctffind => list_matching(dir, &format!("*{CTFFIND_TXT_SUFFIX}"))?
            .iter()
            .filter(|path| !file_name(path).contains("avrot"))
            .map(|path| parse_ctffind_txt(path))
            .collect::<Result<Vec<_>, _>>()?,
    };
    records.sort_by(|a, b| a.micrograph.cmp(&b.micrograph));
    Ok(records)
}

/// Total number of picked particles: one line per particle in every `*_automatch.box` file
pub fn count_box_particles(dir: &Path) -> Result<usize, LogParseError> {
    let mut total = 0;
    for path in list_matching(dir, "*_automatch.box")? {
        total += read(&path)?
            .lines()
            .filter(|l| !l.trim().is_empty())
            .count();
    }
    Ok(total)
}

/// Micrographs split by whether Gctf and ctffind agree on the resolution
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EstimateComparison {
    pub matching: Vec<String>,
    pub differ: Vec<String>,
}

/// Compare the two estimators micrograph by micrograph. Estimates agree when they are within
/// a few Angstrom; with a `resolution_cut`, agreeing micrographs must also have a Gctf
/// estimate better than the cut to count as matching.
pub fn compare_estimates(
    gctf: &[CtfRecord],
    ctffind: &[CtfRecord],
    resolution_cut: Option<f64>,
) -> EstimateComparison {
    let ctffind_by_name: HashMap<&str, &CtfRecord> = ctffind
        .iter()
        .map(|r| (r.micrograph.as_str(), r))
        .collect();
    let mut comparison = EstimateComparison::default();
    for g in gctf {
        let Some(c) = ctffind_by_name.get(g.micrograph.as_str()) else {
            spdlog::warn!("{} has no ctffind result, skipping comparison", g.micrograph);
            continue;
        };
        if (g.resolution - c.resolution).abs() > ESTIMATE_AGREEMENT {
            comparison.differ.push(g.micrograph.clone());
        } else {
            match resolution_cut {
                Some(cut) if cut > 0.0 && g.resolution >= cut => (),
                _ => comparison.matching.push(g.micrograph.clone()),
            }
        }
    }
    comparison
}

fn read(path: &Path) -> Result<String, LogParseError> {
    std::fs::read_to_string(path).map_err(|source| LogParseError::IOError {
        path: path.to_path_buf(),
        source,
    })
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn parse_value(
    path: &Path,
    marker: &'static str,
    line: &str,
    value: &str,
) -> Result<f64, LogParseError> {
    value.parse::<f64>().map_err(|_| LogParseError::Malformed {
        path: path.to_path_buf(),
        marker,
        line: line.trim().to_string(),
    })
}

fn list_matching(dir: &Path, pattern: &str) -> Result<Vec<PathBuf>, LogParseError> {
    let io_err = |source| LogParseError::IOError {
        path: dir.to_path_buf(),
        source,
    };
    let mut found = Vec::new();
    for entry in dir.read_dir().map_err(io_err)? {
        let entry = entry.map_err(io_err)?;
        if glob_match(pattern, &entry.file_name().to_string_lossy()) {
            found.push(entry.path());
        }
    }
    found.sort();
    Ok(found)
}

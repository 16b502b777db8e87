//! Minimal reader and writer for the STAR tables RELION consumes and produces.
//!
//! Only what the pipeline needs is supported: `data_` blocks holding either a `loop_` table
//! or a list of `_label value` pairs, with whitespace separated values.
use std::collections::BTreeSet;
use std::path::Path;

use super::config::Config;
use super::constants::STAR_MICROGRAPH_LABEL;
use super::error::StarError;
use super::logs::CtfRecord;

/// One `data_` block
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StarTable {
    pub name: String,
    pub labels: Vec<String>,
    pub rows: Vec<Vec<String>>,
    pub is_loop: bool,
}

impl StarTable {
    pub fn new_loop(name: &str, labels: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            labels: labels.iter().map(|l| l.to_string()).collect(),
            rows: Vec::new(),
            is_loop: true,
        }
    }

    pub fn push_row(&mut self, row: Vec<String>) {
        self.rows.push(row);
    }

    /// Position of a column
    pub fn column(&self, label: &str) -> Result<usize, StarError> {
        self.labels
            .iter()
            .position(|l| l == label)
            .ok_or_else(|| StarError::MissingColumn {
                table: self.name.clone(),
                label: label.to_string(),
            })
    }

    pub fn has_column(&self, label: &str) -> bool {
        self.labels.iter().any(|l| l == label)
    }

    /// Parse a numeric value from a row
    pub fn value_f64(&self, row: &[String], column: usize) -> Result<f64, StarError> {
        let raw = row.get(column).map(String::as_str).unwrap_or("");
        raw.parse::<f64>().map_err(|_| StarError::BadValue {
            table: self.name.clone(),
            label: self.labels.get(column).cloned().unwrap_or_default(),
            value: raw.to_string(),
        })
    }

    fn render(&self, out: &mut String) {
        out.push_str(&format!("\ndata_{}\n\n", self.name));
        if self.is_loop {
            out.push_str("loop_\n");
            for (idx, label) in self.labels.iter().enumerate() {
                out.push_str(&format!("{label} #{}\n", idx + 1));
            }
            for row in &self.rows {
                out.push_str(&row.join(" "));
                out.push('\n');
            }
        } else if let Some(row) = self.rows.first() {
            for (label, value) in self.labels.iter().zip(row) {
                out.push_str(&format!("{label} {value}\n"));
            }
        }
    }
}

/// Render tables to STAR text
pub fn to_star_string(tables: &[StarTable]) -> String {
    let mut out = String::new();
    for table in tables {
        table.render(&mut out);
    }
    out
}

/// Parse STAR text into its tables
pub fn parse_star(text: &str) -> Vec<StarTable> {
    let mut tables: Vec<StarTable> = Vec::new();
    let mut in_header = false;

    for raw in text.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some(name) = line.strip_prefix("data_") {
            tables.push(StarTable {
                name: name.to_string(),
                ..StarTable::default()
            });
            in_header = false;
            continue;
        }
        let Some(table) = tables.last_mut() else {
            continue;
        };
        if line == "loop_" {
            table.is_loop = true;
            in_header = true;
            continue;
        }
        if line.starts_with('_') {
            let mut parts = line.split_whitespace();
            let label = parts.next().unwrap_or_default().to_string();
            if table.is_loop && in_header {
                table.labels.push(label);
            } else if !table.is_loop {
                let value = parts.next().unwrap_or_default().to_string();
                table.labels.push(label);
                match table.rows.first_mut() {
                    Some(row) => row.push(value),
                    None => table.rows.push(vec![value]),
                }
            }
            continue;
        }
        if table.is_loop {
            in_header = false;
            table
                .rows
                .push(line.split_whitespace().map(str::to_string).collect());
        }
    }
    tables
}

pub fn read_star(path: &Path) -> Result<Vec<StarTable>, StarError> {
    if !path.exists() {
        return Err(StarError::BadFilePath(path.to_path_buf()));
    }
    Ok(parse_star(&std::fs::read_to_string(path)?))
}

pub fn write_star(path: &Path, tables: &[StarTable]) -> Result<(), StarError> {
    std::fs::write(path, to_star_string(tables))?;
    Ok(())
}

/// Single column micrograph list, the format RELION and the CTF tools accept as input
pub fn write_micrograph_list(path: &Path, names: &[String]) -> Result<(), StarError> {
    let mut table = StarTable::new_loop("", &[STAR_MICROGRAPH_LABEL]);
    for name in names {
        table.push_row(vec![name.clone()]);
    }
    write_star(path, &[table])
}

/// Micrograph table with CTF parameters for particle extraction. `file_suffix` is appended to
/// each micrograph name, e.g. `_DW.mrc` to point extraction at the dose weighted images.
pub fn write_ctf_star(
    path: &Path,
    records: &[CtfRecord],
    config: &Config,
    file_suffix: &str,
) -> Result<(), StarError> {
    let amplitude_contrast = if config.negative_stain { 0.35 } else { 0.07 };
    let pixel_size = config.effective_pixel_size();
    let mut table = StarTable::new_loop(
        "",
        &[
            STAR_MICROGRAPH_LABEL,
            "_rlnDefocusU",
            "_rlnDefocusV",
            "_rlnDefocusAngle",
            "_rlnVoltage",
            "_rlnSphericalAberration",
            "_rlnAmplitudeContrast",
            "_rlnMagnification",
            "_rlnDetectorPixelSize",
            "_rlnCtfFigureOfMerit",
            "_rlnCtfMaxResolution",
        ],
    );
    for record in records {
        table.push_row(vec![
            format!("{}{file_suffix}", record.micrograph),
            format!("{:.6}", record.defocus_u),
            format!("{:.6}", record.defocus_v),
            format!("{:.6}", record.angle),
            format!("{:.6}", config.voltage_kv),
            format!("{:.6}", config.spherical_aberration),
            format!("{amplitude_contrast:.6}"),
            // At a magnification of 10000 the detector pixel size (um) equals the pixel size (A)
            format!("{:.6}", 10000.0),
            format!("{:.6}", pixel_size),
            format!("{:.6}", record.cc),
            format!("{:.6}", record.resolution),
        ]);
    }
    write_star(path, &[table])
}

/// Thresholds a 2D class must meet to be kept by automatic selection
#[derive(Debug, Clone, PartialEq)]
pub struct ClassCriteria {
    pub max_resolution: f64,
    pub max_rotation_accuracy: f64,
    pub max_translation_accuracy: f64,
}

impl Default for ClassCriteria {
    fn default() -> Self {
        Self {
            max_resolution: 30.0,
            max_rotation_accuracy: 5.0,
            max_translation_accuracy: 5.0,
        }
    }
}

/// Pick the well defined classes from a `run<N>_it<I>_model.star`
pub fn select_classes(
    model_star: &Path,
    criteria: &ClassCriteria,
) -> Result<BTreeSet<u32>, StarError> {
    let tables = read_star(model_star)?;
    let classes = find_table(&tables, "model_classes", model_star)?;
    let distribution = classes.column("_rlnClassDistribution")?;
    let resolution = classes.column("_rlnEstimatedResolution")?;
    let rotations = classes.column("_rlnAccuracyRotations")?;
    let translations = classes
        .column("_rlnAccuracyTranslationsAngst")
        .or_else(|_| classes.column("_rlnAccuracyTranslations"))?;
    let reference = classes.column("_rlnReferenceImage").ok();

    let mut selected = BTreeSet::new();
    for (idx, row) in classes.rows.iter().enumerate() {
        let res = classes.value_f64(row, resolution)?;
        let keep = classes.value_f64(row, distribution)? > 0.0
            && res > 0.0
            && res < criteria.max_resolution
            && classes.value_f64(row, rotations)? < criteria.max_rotation_accuracy
            && classes.value_f64(row, translations)? < criteria.max_translation_accuracy;
        if keep {
            selected.insert(class_number(reference.and_then(|c| row.get(c)), idx));
        }
    }
    Ok(selected)
}

/// Class number from a reference image name such as `000003@run1_it025_classes.mrcs`,
/// falling back to the row position
fn class_number(reference: Option<&String>, row_index: usize) -> u32 {
    reference
        .and_then(|r| r.split('@').next())
        .and_then(|n| n.parse::<u32>().ok())
        .unwrap_or(row_index as u32 + 1)
}

/// Copy `data_star` to `output`, keeping only particles assigned to one of `classes`.
/// Returns the number of particles kept.
pub fn filter_particles(
    data_star: &Path,
    classes: &BTreeSet<u32>,
    output: &Path,
) -> Result<usize, StarError> {
    let mut tables = read_star(data_star)?;
    let table = tables
        .iter_mut()
        .find(|t| t.is_loop && t.has_column("_rlnClassNumber"))
        .ok_or_else(|| StarError::MissingTable {
            path: data_star.to_path_buf(),
            table: String::from("particles"),
        })?;
    let column = table.column("_rlnClassNumber")?;
    let name = table.name.clone();
    let mut kept = Vec::with_capacity(table.rows.len());
    for row in table.rows.drain(..) {
        let raw = row.get(column).cloned().unwrap_or_default();
        let class = raw.parse::<u32>().map_err(|_| StarError::BadValue {
            table: name.clone(),
            label: String::from("_rlnClassNumber"),
            value: raw.clone(),
        })?;
        if classes.contains(&class) {
            kept.push(row);
        }
    }
    let count = kept.len();
    table.rows = kept;
    write_star(output, &tables)?;
    Ok(count)
}

fn find_table<'a>(
    tables: &'a [StarTable],
    name: &str,
    path: &Path,
) -> Result<&'a StarTable, StarError> {
    tables
        .iter()
        .find(|t| t.name == name)
        .ok_or_else(|| StarError::MissingTable {
            path: path.to_path_buf(),
            table: name.to_string(),
        })
}

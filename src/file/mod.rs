// src/file/mod.rs - Packaged print jobs (zip of layer images + manifest)
use regex::Regex;
use resin_shared::PrintParameters;
use std::collections::HashSet;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use thiserror::Error;
use zip::ZipArchive;

/// Manifest entry inside the archive.
pub const MANIFEST_NAME: &str = "run.gcode";
/// Preview images, in lookup priority. Never counted as layers.
pub const PREVIEW_NAMES: [&str; 3] = ["preview_cropping.png", "preview.png", "thumbnail.png"];

const BLADE_SPEED_PATTERN: &str = r"G0\s+X[\d.]+\s+F(\d+)";
const MANIFEST_LINE_PATTERN: &str = r"^;\s*([A-Za-z][A-Za-z0-9_]*)\s*[:=]\s*(\S+)";

#[derive(Debug, Error)]
pub enum PackageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Archive error: {0}")]
    Zip(#[from] zip::result::ZipError),
    #[error("Pattern error: {0}")]
    Pattern(#[from] regex::Error),
    #[error("Layer {index} out of range (package has {count} layers)")]
    LayerOutOfRange { index: usize, count: usize },
    #[error("Invalid package: {0}")]
    Invalid(String),
}

/// Reads `;key:value` / `;key = value` comment lines of a manifest on top of
/// the default parameters. The first occurrence of a key wins; blade speed
/// comes from the first `G0 X.. F..` line.
pub fn parse_manifest(content: &str) -> Result<PrintParameters, PackageError> {
    let line_re = Regex::new(MANIFEST_LINE_PATTERN)?;
    let blade_re = Regex::new(BLADE_SPEED_PATTERN)?;

    let mut params = PrintParameters::default();
    let mut seen = HashSet::new();

    for line in content.lines() {
        let Some(caps) = line_re.captures(line.trim()) else {
            continue;
        };
        let key = &caps[1];
        let value = &caps[2];
        if !seen.insert(key.to_string()) {
            continue;
        }
        if let Err(reason) = apply_manifest_key(&mut params, key, value) {
            tracing::warn!("Ignoring manifest value {}={}: {}", key, value, reason);
        }
    }

    if let Some(caps) = blade_re.captures(content) {
        match caps[1].parse::<f64>() {
            Ok(speed) => params.blade_speed = speed,
            Err(e) => tracing::warn!("Ignoring blade speed '{}': {}", &caps[1], e),
        }
    }

    Ok(params)
}

fn apply_manifest_key(params: &mut PrintParameters, key: &str, value: &str) -> Result<(), String> {
    let number = || value.parse::<f64>().map_err(|e| e.to_string());
    // Integer keys accept "12.0" the way slicers sometimes write them.
    let count = || number().map(|v| v.max(0.0) as usize);

    match key {
        "totalLayer" => params.total_layers = count()?,
        "layerHeight" => params.layer_height = number()?,
        "estimatedPrintTime" => params.estimated_print_time = number()?,
        "bottomLayerCount" => params.bottom_layer_count = count()?,
        "bottomLayerExposureTime" => params.bottom_exposure_time = number()?,
        "bottomLayerLiftHeight" => params.bottom_lift_height = number()?,
        "bottomLayerLiftSpeed" => params.bottom_lift_speed = number()?,
        "normalExposureTime" => params.normal_exposure_time = number()?,
        "normalLayerLiftHeight" => params.normal_lift_height = number()?,
        "normalLayerLiftSpeed" => params.normal_lift_speed = number()?,
        "normalDropSpeed" => params.drop_speed = number()?,
        "resolutionX" => params.resolution_x = count()? as u32,
        "resolutionY" => params.resolution_y = count()? as u32,
        _ => {}
    }
    Ok(())
}

fn base_name(entry: &str) -> &str {
    entry.rsplit('/').next().unwrap_or(entry)
}

fn is_png(name: &str) -> bool {
    name.to_ascii_lowercase().ends_with(".png")
}

fn is_preview(name: &str) -> bool {
    let lower = base_name(name).to_ascii_lowercase();
    PREVIEW_NAMES.iter().any(|p| *p == lower)
}

/// First run of digits in the file name, if any.
fn first_number(name: &str) -> Option<u64> {
    let digits: String = base_name(name)
        .chars()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}

/// Layer image entries of an archive listing, in print order.
pub fn layer_entries<'a, I>(names: I) -> Vec<String>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut layers: Vec<(u64, String)> = names
        .into_iter()
        .filter(|name| is_png(name) && !is_preview(name))
        .filter_map(|name| first_number(name).map(|n| (n, name.to_string())))
        .collect();
    layers.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
    layers.into_iter().map(|(_, name)| name).collect()
}

/// A print job archive on disk.
///
/// The archive is reopened on every read so a transient failure does not
/// poison later reads.
#[derive(Debug, Clone)]
pub struct JobPackage {
    path: PathBuf,
    names: Vec<String>,
    layers: Vec<String>,
    manifest: Option<String>,
}

impl JobPackage {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, PackageError> {
        let path = path.as_ref().to_path_buf();
        let archive = ZipArchive::new(File::open(&path)?)?;
        let names: Vec<String> = archive.file_names().map(str::to_string).collect();
        let layers = layer_entries(names.iter().map(String::as_str));
        let manifest = names
            .iter()
            .find(|name| name.eq_ignore_ascii_case(MANIFEST_NAME))
            .cloned();
        tracing::info!(
            "Opened job package {} ({} layers, manifest {})",
            path.display(),
            layers.len(),
            if manifest.is_some() { "present" } else { "missing" }
        );
        Ok(Self { path, names, layers, manifest })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn layer_count(&self) -> usize {
        self.layers.len()
    }

    pub fn layer_names(&self) -> &[String] {
        &self.layers
    }

    fn read_entry(&self, name: &str) -> Result<Vec<u8>, PackageError> {
        let mut archive = ZipArchive::new(File::open(&self.path)?)?;
        let mut entry = archive.by_name(name)?;
        let mut data = Vec::with_capacity(entry.size() as usize);
        entry.read_to_end(&mut data)?;
        Ok(data)
    }

    /// Parameters from the manifest, with defaults for anything missing.
    /// The number of layer images wins over the manifest's layer count.
    pub fn parameters(&self) -> Result<PrintParameters, PackageError> {
        let mut params = match &self.manifest {
            Some(name) => {
                let bytes = self.read_entry(name)?;
                parse_manifest(&String::from_utf8_lossy(&bytes))?
            }
            None => {
                tracing::warn!("{} has no {}, using default parameters", self.path.display(), MANIFEST_NAME);
                PrintParameters::default()
            }
        };
        if !self.layers.is_empty() {
            if params.total_layers != self.layers.len() {
                tracing::debug!(
                    "Manifest layer count {} replaced by image count {}",
                    params.total_layers,
                    self.layers.len()
                );
            }
            params.total_layers = self.layers.len();
        }
        Ok(params)
    }

    pub fn layer_image(&self, index: usize) -> Result<Vec<u8>, PackageError> {
        let name = self.layers.get(index).ok_or(PackageError::LayerOutOfRange {
            index,
            count: self.layers.len(),
        })?;
        tracing::debug!("Reading layer {} from {}", index, name);
        self.read_entry(name)
    }

    /// First preview image found, by [`PREVIEW_NAMES`] priority and then
    /// any `.png` with "preview" in its name.
    pub fn preview_image(&self) -> Result<Option<Vec<u8>>, PackageError> {
        let exact = PREVIEW_NAMES
            .iter()
            .find_map(|preview| self.names.iter().find(|name| name.as_str() == *preview));
        let fallback = || {
            self.names
                .iter()
                .find(|name| is_png(name) && name.to_ascii_lowercase().contains("preview"))
        };
        match exact.or_else(fallback) {
            Some(name) => Ok(Some(self.read_entry(name)?)),
            None => Ok(None),
        }
    }
}

/// Structural check of a job archive before it is offered for printing.
pub fn validate_package(path: impl AsRef<Path>) -> Result<(), PackageError> {
    let package = JobPackage::open(path)?;
    if package.manifest.is_none() {
        return Err(PackageError::Invalid(format!("{} is missing", MANIFEST_NAME)));
    }

    let lower: HashSet<String> = package.names.iter().map(|n| n.to_ascii_lowercase()).collect();
    for required in ["preview_cropping.png", "preview.png"] {
        if !lower.contains(required) {
            return Err(PackageError::Invalid(format!("preview image {} is missing", required)));
        }
    }

    let numbered = Regex::new(r"^(\d+)\.png$")?;
    let mut numbers: Vec<u64> = package
        .names
        .iter()
        .filter_map(|name| {
            let base = base_name(name).to_ascii_lowercase();
            numbered.captures(&base).and_then(|caps| caps[1].parse().ok())
        })
        .collect();
    if numbers.is_empty() {
        return Err(PackageError::Invalid("no layer images".to_string()));
    }
    numbers.sort_unstable();
    let first = numbers[0];
    if let Some((i, n)) = numbers.iter().enumerate().find(|(i, n)| **n != first + *i as u64) {
        return Err(PackageError::Invalid(format!(
            "layer images not contiguous: expected {} but found {}",
            first + i as u64,
            n
        )));
    }
    Ok(())
}

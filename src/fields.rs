use std::collections::BTreeMap;

use serde::Serialize;

use crate::domain::Datatype;
use crate::error::BidsError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldSpec {
    pub code: u32,
    pub datatype: Datatype,
    pub suffix: String,
    pub extensions: Vec<String>,
    pub sidecars: Vec<String>,
    pub multi_run: bool,
}

impl FieldSpec {
    pub fn new(code: u32, datatype: Datatype, suffix: &str, extension: &str) -> Self {
        Self {
            code,
            datatype,
            suffix: suffix.to_string(),
            extensions: vec![extension.to_string()],
            sidecars: Vec::new(),
            multi_run: false,
        }
    }

    pub fn accepts_extension(&self, extension: &str) -> bool {
        self.extensions.iter().any(|ext| ext == extension)
            || self.sidecars.iter().any(|ext| ext == extension)
    }

    pub fn validate(&self) -> Result<(), BidsError> {
        if !is_valid_suffix(&self.suffix) {
            return Err(BidsError::InvalidConfig(format!(
                "field {}: invalid suffix {:?}",
                self.code, self.suffix
            )));
        }
        if self.extensions.is_empty() {
            return Err(BidsError::InvalidConfig(format!(
                "field {}: at least one extension is required",
                self.code
            )));
        }
        for ext in self.extensions.iter().chain(&self.sidecars) {
            if !is_valid_extension(ext) {
                return Err(BidsError::InvalidConfig(format!(
                    "field {}: invalid extension {ext:?}",
                    self.code
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldTable {
    fields: BTreeMap<u32, FieldSpec>,
}

impl FieldTable {
    pub fn empty() -> Self {
        Self {
            fields: BTreeMap::new(),
        }
    }

    pub fn builtin() -> Self {
        let mut table = Self::empty();
        for spec in builtin_fields() {
            table.fields.insert(spec.code, spec);
        }
        table
    }

    pub fn insert(&mut self, spec: FieldSpec) -> Result<(), BidsError> {
        spec.validate()?;
        self.fields.insert(spec.code, spec);
        Ok(())
    }

    pub fn get(&self, code: u32) -> Option<&FieldSpec> {
        self.fields.get(&code)
    }

    pub fn iter(&self) -> impl Iterator<Item = &FieldSpec> {
        self.fields.values()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn sidecars_for(
        &self,
        datatype: Datatype,
        suffix: &str,
        extension: &str,
    ) -> Option<&[String]> {
        self.fields
            .values()
            .find(|spec| {
                spec.datatype == datatype
                    && spec.suffix == suffix
                    && spec.extensions.iter().any(|ext| ext == extension)
            })
            .map(|spec| spec.sidecars.as_slice())
    }

    pub fn check_unique_targets(&self) -> Result<(), BidsError> {
        let mut seen = BTreeMap::<(Datatype, &str, &str), u32>::new();
        for spec in self.fields.values() {
            for ext in &spec.extensions {
                let target = (spec.datatype, spec.suffix.as_str(), ext.as_str());
                if let Some(other) = seen.insert(target, spec.code) {
                    return Err(BidsError::InvalidConfig(format!(
                        "fields {other} and {} both map to {}/{}.{ext}",
                        spec.code, spec.datatype, spec.suffix
                    )));
                }
            }
        }
        Ok(())
    }
}

fn is_valid_suffix(suffix: &str) -> bool {
    !suffix.is_empty()
        && !suffix.starts_with(['_', '-'])
        && !suffix.ends_with(['_', '-'])
        && !suffix.contains("__")
        && suffix
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '_' || ch == '-')
}

fn is_valid_extension(ext: &str) -> bool {
    !ext.is_empty()
        && ext
            .split('.')
            .all(|part| !part.is_empty() && part.chars().all(|ch| ch.is_ascii_alphanumeric()))
}

fn builtin_fields() -> Vec<FieldSpec> {
    use Datatype::{Anat, Dwi, Func, Perf};

    let mut fields = vec![
        FieldSpec::new(20227, Func, "bold", "zip"),
        FieldSpec::new(20249, Func, "task-hariri_bold", "zip"),
        FieldSpec::new(20250, Dwi, "dwi", "zip"),
        FieldSpec::new(20251, Anat, "T2starw", "zip"),
        FieldSpec::new(20252, Anat, "T1w", "zip"),
        FieldSpec::new(20253, Anat, "FLAIR", "zip"),
        FieldSpec::new(20263, Anat, "desc-freesurfer_T1w", "zip"),
        FieldSpec::new(25750, Func, "desc-fullcorr25_relmat", "txt"),
        FieldSpec::new(25751, Func, "desc-fullcorr100_relmat", "txt"),
        FieldSpec::new(25752, Func, "desc-partialcorr25_relmat", "txt"),
        FieldSpec::new(25753, Func, "desc-partialcorr100_relmat", "txt"),
        FieldSpec::new(25754, Func, "desc-amplitudes25_timeseries", "txt"),
        FieldSpec::new(25755, Func, "desc-amplitudes100_timeseries", "txt"),
        FieldSpec::new(26300, Perf, "asl", "zip"),
        FieldSpec::new(26301, Anat, "Chimap", "zip"),
        FieldSpec::new(31000, Anat, "desc-mni2native_xfm", "zip"),
    ];

    // Native-space parcellations, dMRI (31001-31008) and surface (31009-31013).
    let dwi_atlases = [
        "aparca2009s",
        "aparc",
        "glasser",
        "schaefer7n200p",
        "schaefer7n500p",
        "tians1",
        "tians4",
        "schaefer7n1000p",
    ];
    for (offset, atlas) in dwi_atlases.iter().enumerate() {
        fields.push(FieldSpec::new(
            31001 + offset as u32,
            Dwi,
            &format!("atlas-{atlas}_space-native_dseg"),
            "zip",
        ));
    }
    let surface_atlases = ["aparca2009s", "aparc", "glasser", "schaefer7n", "tian"];
    for (offset, atlas) in surface_atlases.iter().enumerate() {
        fields.push(FieldSpec::new(
            31009 + offset as u32,
            Anat,
            &format!("atlas-{atlas}_space-native_desc-sf_dseg"),
            "zip",
        ));
    }

    let timeseries = ["aparca2009s", "aparc", "glasser", "global", "schaefer7n", "tian"];
    for (offset, atlas) in timeseries.iter().enumerate() {
        fields.push(FieldSpec::new(
            31014 + offset as u32,
            Func,
            &format!("atlas-{atlas}_timeseries"),
            "zip",
        ));
    }

    let connectomes = [
        "aparca2009stians1",
        "aparctians1",
        "glassertians1",
        "glassertians4",
        "schaefer7n1000ptians4",
        "schaefer7n200ptians1",
        "schaefer7n500ptians4",
    ];
    for (offset, atlas) in connectomes.iter().enumerate() {
        fields.push(FieldSpec::new(
            31020 + offset as u32,
            Dwi,
            &format!("atlas-{atlas}_relmat"),
            "zip",
        ));
    }

    fields.push(FieldSpec::new(31027, Dwi, "desc-endpoints_tractography", "zip"));
    fields.push(FieldSpec::new(31028, Dwi, "desc-quality_tractography", "zip"));
    fields
}

//! Gadget metadata: the YAML document carried as the image config blob.
//!
//! The metadata declares what a gadget implements (tracers, toppers,
//! snapshotters, profilers), the structs its events are made of, and the
//! parameters it accepts. It is validated against and populated from the
//! type information embedded in the gadget's compiled program.

use crate::constants::DEFAULT_COLUMN_WIDTH;
use crate::datasource::FieldKind;
use crate::error::{Error, Result};
use crate::params::ParamDesc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, warn};

// =============================================================================
// Identifier Prefixes
// =============================================================================

/// Prefix marking tracer declarations in the compiled program.
pub const TRACER_PREFIX: &str = "gadget_tracer_";

/// Prefix marking topper declarations.
pub const TOPPER_PREFIX: &str = "gadget_topper_";

/// Prefix marking parameter declarations.
pub const PARAM_PREFIX: &str = "gadget_param_";

/// Prefix marking snapshotter declarations.
pub const SNAPSHOTTER_PREFIX: &str = "gadget_snapshotter_";

/// Separator between the encoded parts of a gadget identifier.
const IDENT_SEPARATOR: &str = "___";

// =============================================================================
// Metadata Document
// =============================================================================

/// Column alignment of a rendered field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Alignment {
    #[default]
    #[serde(rename = "")]
    None,
    Left,
    Right,
}

/// How to abbreviate a field value that exceeds the column width.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EllipsisType {
    #[default]
    #[serde(rename = "")]
    None,
    Start,
    Middle,
    End,
}

/// Display attributes of a struct field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct FieldAttributes {
    #[serde(skip_serializing_if = "is_zero")]
    pub width: u32,
    #[serde(skip_serializing_if = "is_zero")]
    pub min_width: u32,
    #[serde(skip_serializing_if = "is_zero")]
    pub max_width: u32,
    #[serde(skip_serializing_if = "is_default_alignment")]
    pub alignment: Alignment,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub hidden: bool,
    #[serde(skip_serializing_if = "is_default_ellipsis")]
    pub ellipsis: EllipsisType,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub template: String,
}

fn is_zero(v: &u32) -> bool {
    *v == 0
}

fn is_default_alignment(v: &Alignment) -> bool {
    *v == Alignment::None
}

fn is_default_ellipsis(v: &EllipsisType) -> bool {
    *v == EllipsisType::None
}

/// A field of an event struct.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct StructField {
    pub name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub description: String,
    pub attributes: FieldAttributes,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub annotations: HashMap<String, serde_yaml::Value>,
}

/// A struct generated by the gadget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct StructMeta {
    pub fields: Vec<StructField>,
}

/// A gadget that streams events to user space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct Tracer {
    /// Name of the buffer map the gadget emits events through.
    pub map_name: String,
    /// Name of the event struct.
    pub struct_name: String,
}

/// A gadget that reports current activity sorted by a resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct Topper {
    pub map_name: String,
    pub struct_name: String,
}

/// A gadget that dumps the state of a subsystem.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct Snapshotter {
    pub struct_name: String,
}

/// A gadget that profiles a subsystem.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct Profiler {
    pub struct_key_name: String,
    pub struct_value_name: String,
    pub map_name: String,
}

/// The gadget metadata document.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct GadgetMetadata {
    pub name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(rename = "homepageURL", skip_serializing_if = "String::is_empty")]
    pub homepage_url: String,
    #[serde(rename = "documentationURL", skip_serializing_if = "String::is_empty")]
    pub documentation_url: String,
    #[serde(rename = "sourceURL", skip_serializing_if = "String::is_empty")]
    pub source_url: String,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub annotations: HashMap<String, String>,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub tracers: HashMap<String, Tracer>,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub toppers: HashMap<String, Topper>,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub snapshotters: HashMap<String, Snapshotter>,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub profilers: HashMap<String, Profiler>,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub structs: HashMap<String, StructMeta>,
    #[serde(rename = "ebpfParams", skip_serializing_if = "HashMap::is_empty")]
    pub ebpf_params: HashMap<String, ParamDesc>,
    #[serde(rename = "gadgetParams", skip_serializing_if = "HashMap::is_empty")]
    pub gadget_params: HashMap<String, ParamDesc>,
}

// =============================================================================
// Program Type Information
// =============================================================================

/// Kind of a map declared by the compiled program.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapKind {
    RingBuf,
    PerfEventArray,
    Hash,
}

/// A field of a struct in the program's type information.
#[derive(Debug, Clone)]
pub struct TypeField {
    pub name: String,
    pub kind: FieldKind,
    /// Static size in bytes for char-array fields; 0 otherwise.
    pub size: u32,
}

impl TypeField {
    pub fn new(name: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            kind,
            size: 0,
        }
    }

    pub fn sized(name: impl Into<String>, kind: FieldKind, size: u32) -> Self {
        Self {
            name: name.into(),
            kind,
            size,
        }
    }
}

/// Type information extracted from the gadget's compiled program.
#[derive(Debug, Clone, Default)]
pub struct ProgramInfo {
    /// Struct name → fields.
    pub structs: HashMap<String, Vec<TypeField>>,
    /// Map name → kind.
    pub maps: HashMap<String, MapKind>,
    /// Map name → name of the map's value struct, where known.
    pub map_value_types: HashMap<String, String>,
    /// Parameter variable names.
    pub params: Vec<String>,
    /// Exported `gadget_*` identifiers, with prefixes.
    pub identifiers: Vec<String>,
}

impl ProgramInfo {
    /// Returns the identifiers carrying `prefix`, with the prefix stripped.
    pub fn idents_by_prefix(&self, prefix: &str) -> Vec<&str> {
        self.identifiers
            .iter()
            .filter_map(|ident| ident.strip_prefix(prefix))
            .collect()
    }
}

/// Decoded `gadget_tracer_` identifier: `name___map___event_type`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TracerIdent {
    pub name: String,
    pub map_name: String,
    pub event_type: String,
}

/// Decoded `gadget_topper_` identifier: `name___map`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopperIdent {
    pub name: String,
    pub map_name: String,
}

/// Decoded `gadget_snapshotter_` identifier: `name___struct`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotterIdent {
    pub name: String,
    pub struct_name: String,
}

fn split_ident<const N: usize>(ident: &str) -> Result<[&str; N]> {
    let parts: Vec<&str> = ident.split(IDENT_SEPARATOR).collect();
    let parts: [&str; N] = parts
        .try_into()
        .map_err(|_| Error::BadIdentifier(ident.to_string()))?;
    if parts.iter().any(|p| p.is_empty()) {
        return Err(Error::BadIdentifier(ident.to_string()));
    }
    Ok(parts)
}

/// Returns the tracer declared by the program, if any. With multiple
/// declarations the first is used and a warning logged.
pub fn tracer_ident(info: &ProgramInfo) -> Result<Option<TracerIdent>> {
    let idents = info.idents_by_prefix(TRACER_PREFIX);
    let Some(first) = idents.first() else {
        return Ok(None);
    };
    if idents.len() > 1 {
        warn!(using = first, "multiple tracers declared");
    }
    let [name, map_name, event_type] = split_ident::<3>(first)?;
    Ok(Some(TracerIdent {
        name: name.to_string(),
        map_name: map_name.to_string(),
        event_type: event_type.to_string(),
    }))
}

/// Returns the topper declared by the program, if any.
pub fn topper_ident(info: &ProgramInfo) -> Result<Option<TopperIdent>> {
    let idents = info.idents_by_prefix(TOPPER_PREFIX);
    let Some(first) = idents.first() else {
        return Ok(None);
    };
    if idents.len() > 1 {
        warn!(using = first, "multiple toppers declared");
    }
    let [name, map_name] = split_ident::<2>(first)?;
    Ok(Some(TopperIdent {
        name: name.to_string(),
        map_name: map_name.to_string(),
    }))
}

/// Returns the snapshotter declared by the program, if any.
pub fn snapshotter_ident(info: &ProgramInfo) -> Result<Option<SnapshotterIdent>> {
    let idents = info.idents_by_prefix(SNAPSHOTTER_PREFIX);
    let Some(first) = idents.first() else {
        return Ok(None);
    };
    if idents.len() > 1 {
        warn!(using = first, "multiple snapshotters declared");
    }
    let [name, struct_name] = split_ident::<2>(first)?;
    Ok(Some(SnapshotterIdent {
        name: name.to_string(),
        struct_name: struct_name.to_string(),
    }))
}

// =============================================================================
// Validation
// =============================================================================

impl GadgetMetadata {
    /// Parses a metadata document from YAML bytes.
    pub fn from_yaml(raw: &[u8]) -> Result<Self> {
        serde_yaml::from_slice(raw).map_err(|e| Error::InvalidMetadata(e.to_string()))
    }

    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).map_err(|e| Error::InvalidMetadata(e.to_string()))
    }

    fn implementation_count(&self) -> usize {
        [
            !self.tracers.is_empty(),
            !self.toppers.is_empty(),
            !self.snapshotters.is_empty(),
            !self.profilers.is_empty(),
        ]
        .iter()
        .filter(|&&present| present)
        .count()
    }

    /// Validates the document against the program's type information,
    /// collecting all problems before failing.
    pub fn validate(&self, info: &ProgramInfo) -> Result<()> {
        let mut problems = Vec::new();

        if self.name.is_empty() {
            problems.push("gadget name is required".to_string());
        }

        let impls = self.implementation_count();
        if impls > 1 {
            problems.push(format!(
                "gadget can implement only one of tracer, snapshotter, topper or profiler, found {}",
                impls
            ));
        }

        if self.tracers.len() > 1 {
            problems.push("only one tracer is allowed".to_string());
        }
        for (name, tracer) in &self.tracers {
            self.check_map_and_struct(
                info,
                &tracer.map_name,
                &tracer.struct_name,
                &[MapKind::RingBuf, MapKind::PerfEventArray],
                &mut problems,
                &format!("tracer '{}'", name),
            );
        }

        if self.toppers.len() > 1 {
            problems.push("only one topper is allowed".to_string());
        }
        for (name, topper) in &self.toppers {
            self.check_map_and_struct(
                info,
                &topper.map_name,
                &topper.struct_name,
                &[MapKind::Hash],
                &mut problems,
                &format!("topper '{}'", name),
            );
        }

        if self.snapshotters.len() > 1 {
            problems.push("only one snapshotter is allowed".to_string());
        }
        for (name, snap) in &self.snapshotters {
            if snap.struct_name.is_empty() {
                problems.push(format!("snapshotter '{}' is missing structName", name));
            } else if !self.structs.contains_key(&snap.struct_name) {
                problems.push(format!(
                    "snapshotter '{}' references unknown struct '{}'",
                    name, snap.struct_name
                ));
            }
        }

        if self.profilers.len() > 1 {
            problems.push("only one profiler is allowed".to_string());
        }
        for (name, profiler) in &self.profilers {
            if profiler.struct_key_name.is_empty() {
                problems.push(format!("profiler '{}' is missing structKeyName", name));
            } else if !self.structs.contains_key(&profiler.struct_key_name) {
                problems.push(format!(
                    "profiler '{}' references unknown key struct '{}'",
                    name, profiler.struct_key_name
                ));
            }
            self.check_map_and_struct(
                info,
                &profiler.map_name,
                &profiler.struct_value_name,
                &[MapKind::Hash],
                &mut problems,
                &format!("profiler '{}'", name),
            );
        }

        for (name, meta) in &self.structs {
            let Some(program_fields) = info.structs.get(name) else {
                problems.push(format!("struct '{}' not found in program type info", name));
                continue;
            };
            for field in &meta.fields {
                if !program_fields.iter().any(|f| f.name == field.name) {
                    problems.push(format!(
                        "field '{}' not found in program struct '{}'",
                        field.name, name
                    ));
                }
            }
        }

        for (name, desc) in &self.ebpf_params {
            if desc.key.is_empty() {
                problems.push(format!("param '{}' has an empty key", name));
            }
            if !info.params.iter().any(|p| p == name) {
                problems.push(format!("param '{}' not found in program", name));
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(Error::MetadataValidation(problems.join("; ")))
        }
    }

    fn check_map_and_struct(
        &self,
        info: &ProgramInfo,
        map_name: &str,
        struct_name: &str,
        accepted: &[MapKind],
        problems: &mut Vec<String>,
        subject: &str,
    ) {
        if map_name.is_empty() {
            problems.push(format!("{}: missing mapName", subject));
        } else {
            match info.maps.get(map_name) {
                None => problems.push(format!("{}: map '{}' not found in program", subject, map_name)),
                Some(kind) if !accepted.contains(kind) => problems.push(format!(
                    "{}: map '{}' has wrong kind {:?}, expected one of {:?}",
                    subject, map_name, kind, accepted
                )),
                Some(_) => {}
            }
        }

        if struct_name.is_empty() {
            problems.push(format!("{}: missing structName", subject));
        } else if !self.structs.contains_key(struct_name) {
            problems.push(format!(
                "{}: referencing unknown struct '{}'",
                subject, struct_name
            ));
        }
    }

    // =========================================================================
    // Population
    // =========================================================================

    /// Fills the document from the program's type information: declared
    /// tracers/toppers/snapshotters, their structs with derived display
    /// attributes, and parameter descriptors.
    pub fn populate(&mut self, info: &ProgramInfo) -> Result<()> {
        if let Some(tracer) = tracer_ident(info)? {
            if !info.maps.contains_key(&tracer.map_name) {
                return Err(Error::MetadataValidation(format!(
                    "tracer map '{}' not found in program",
                    tracer.map_name
                )));
            }
            if !self.tracers.contains_key(&tracer.name) {
                debug!(tracer = %tracer.name, map = %tracer.map_name, "adding tracer");
                self.tracers.insert(
                    tracer.name.clone(),
                    Tracer {
                        map_name: tracer.map_name.clone(),
                        struct_name: tracer.event_type.clone(),
                    },
                );
            }
            self.populate_struct(&tracer.event_type, info)?;
        }

        if let Some(topper) = topper_ident(info)? {
            if !info.maps.contains_key(&topper.map_name) {
                return Err(Error::MetadataValidation(format!(
                    "topper map '{}' not found in program",
                    topper.map_name
                )));
            }
            // the topper struct is the value type of its hash map
            let struct_name = info
                .map_value_types
                .get(&topper.map_name)
                .cloned()
                .ok_or_else(|| {
                    Error::MetadataValidation(format!(
                        "topper map '{}' has no value type information",
                        topper.map_name
                    ))
                })?;
            if !self.toppers.contains_key(&topper.name) {
                debug!(topper = %topper.name, "adding topper");
                self.toppers.insert(
                    topper.name.clone(),
                    Topper {
                        map_name: topper.map_name.clone(),
                        struct_name: struct_name.clone(),
                    },
                );
            }
            self.populate_struct(&struct_name, info)?;
        }

        if let Some(snap) = snapshotter_ident(info)? {
            if !self.snapshotters.contains_key(&snap.name) {
                debug!(snapshotter = %snap.name, "adding snapshotter");
                self.snapshotters.insert(
                    snap.name.clone(),
                    Snapshotter {
                        struct_name: snap.struct_name.clone(),
                    },
                );
            }
            self.populate_struct(&snap.struct_name, info)?;
        }

        for param in &info.params {
            if self.ebpf_params.contains_key(param) {
                debug!(param, "param already defined, skipping");
                continue;
            }
            self.ebpf_params.insert(
                param.clone(),
                ParamDesc::new(param.clone()),
            );
        }

        Ok(())
    }

    fn populate_struct(&mut self, struct_name: &str, info: &ProgramInfo) -> Result<()> {
        let program_fields = info.structs.get(struct_name).ok_or_else(|| {
            Error::MetadataValidation(format!("struct '{}' not found in program", struct_name))
        })?;

        let entry = self.structs.entry(struct_name.to_string()).or_default();
        for field in program_fields {
            if entry.fields.iter().any(|f| f.name == field.name) {
                debug!(field = %field.name, "field already exists, skipping");
                continue;
            }
            entry.fields.push(StructField {
                name: field.name.clone(),
                description: String::new(),
                attributes: FieldAttributes {
                    width: column_width(field.kind),
                    alignment: Alignment::Left,
                    ellipsis: EllipsisType::End,
                    ..Default::default()
                },
                annotations: HashMap::new(),
            });
        }
        Ok(())
    }

    /// Typed parameter descriptors to publish on the gadget context.
    pub fn param_descs(&self) -> Vec<ParamDesc> {
        self.ebpf_params
            .values()
            .chain(self.gadget_params.values())
            .cloned()
            .collect()
    }
}

/// Derives a sensible column width from the field's integer size.
fn column_width(kind: FieldKind) -> u32 {
    match kind {
        // widest decimal rendering incl. sign
        FieldKind::Int8 => 4,
        FieldKind::Int16 => 6,
        FieldKind::Int32 => 11,
        FieldKind::Int64 => 20,
        FieldKind::Uint8 => 3,
        FieldKind::Uint16 => 5,
        FieldKind::Uint32 => 10,
        FieldKind::Uint64 => 20,
        FieldKind::Bool => 5,
        _ => DEFAULT_COLUMN_WIDTH,
    }
}

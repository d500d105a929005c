//! Tests for gadget metadata parsing, validation and population.

use gadgetrun::metadata::{
    snapshotter_ident, topper_ident, tracer_ident, GadgetMetadata, MapKind, StructMeta, TypeField,
};
use gadgetrun::{ErrorKind, FieldKind, ProgramInfo};

// =============================================================================
// Fixtures
// =============================================================================

const DNS_METADATA: &str = r#"
name: trace_dns
description: Trace DNS queries and responses
homepageURL: https://inspektor-gadget.io
documentationURL: https://inspektor-gadget.io/docs
sourceURL: https://github.com/example/trace-dns
annotations:
  category: network
tracers:
  dns:
    mapName: events
    structName: event_dns
structs:
  event_dns:
    fields:
      - name: pid
        description: Process ID
        attributes:
          width: 10
          alignment: right
      - name: name
        description: Queried name
        attributes:
          width: 30
          ellipsis: middle
ebpfParams:
  targ_pid:
    key: pid
    description: Filter by process ID
gadgetParams:
  iface:
    key: iface
    description: Network interface to attach to
"#;

fn dns_program() -> ProgramInfo {
    let mut info = ProgramInfo::default();
    info.structs.insert(
        "event_dns".to_string(),
        vec![
            TypeField::new("pid", FieldKind::Uint32),
            TypeField::sized("name", FieldKind::CString, 128),
            TypeField::new("latency", FieldKind::Uint64),
            TypeField::new("qtype", FieldKind::Uint16),
        ],
    );
    info.maps.insert("events".to_string(), MapKind::RingBuf);
    info.params.push("targ_pid".to_string());
    info.identifiers
        .push("gadget_tracer_dns___events___event_dns".to_string());
    info.identifiers.push("gadget_param_targ_pid".to_string());
    info
}

// =============================================================================
// Parsing Tests
// =============================================================================

#[test]
fn test_full_document_parses() {
    let meta = GadgetMetadata::from_yaml(DNS_METADATA.as_bytes()).unwrap();
    assert_eq!(meta.name, "trace_dns");
    assert_eq!(meta.annotations["category"], "network");
    assert_eq!(meta.tracers["dns"].struct_name, "event_dns");
    assert_eq!(meta.structs["event_dns"].fields.len(), 2);
    assert_eq!(meta.ebpf_params["targ_pid"].key, "pid");
    assert_eq!(meta.gadget_params["iface"].key, "iface");
}

#[test]
fn test_garbage_document_is_invalid_metadata() {
    let err = GadgetMetadata::from_yaml(b"{{{ not yaml").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Metadata);
}

#[test]
fn test_param_descs_merge_both_param_maps() {
    let meta = GadgetMetadata::from_yaml(DNS_METADATA.as_bytes()).unwrap();
    let keys: Vec<String> = meta.param_descs().into_iter().map(|d| d.key).collect();
    assert!(keys.contains(&"pid".to_string()));
    assert!(keys.contains(&"iface".to_string()));
}

// =============================================================================
// Identifier Extraction Tests
// =============================================================================

#[test]
fn test_identifier_extraction_by_prefix() {
    let info = dns_program();
    let tracer = tracer_ident(&info).unwrap().unwrap();
    assert_eq!(tracer.name, "dns");
    assert_eq!(tracer.map_name, "events");
    assert_eq!(tracer.event_type, "event_dns");

    assert!(topper_ident(&info).unwrap().is_none());
    assert!(snapshotter_ident(&info).unwrap().is_none());
}

#[test]
fn test_topper_and_snapshotter_identifiers() {
    let mut info = ProgramInfo::default();
    info.identifiers
        .push("gadget_topper_blockio___counts".to_string());
    info.identifiers
        .push("gadget_snapshotter_sockets___socket_entry".to_string());

    let topper = topper_ident(&info).unwrap().unwrap();
    assert_eq!(topper.name, "blockio");
    assert_eq!(topper.map_name, "counts");

    let snap = snapshotter_ident(&info).unwrap().unwrap();
    assert_eq!(snap.name, "sockets");
    assert_eq!(snap.struct_name, "socket_entry");
}

#[test]
fn test_malformed_identifiers_fail() {
    let mut info = ProgramInfo::default();
    info.identifiers
        .push("gadget_tracer_missing_separators".to_string());
    let err = tracer_ident(&info).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Metadata);
}

// =============================================================================
// Validation Tests
// =============================================================================

#[test]
fn test_valid_document_passes() {
    let meta = GadgetMetadata::from_yaml(DNS_METADATA.as_bytes()).unwrap();
    meta.validate(&dns_program()).unwrap();
}

#[test]
fn test_missing_name_fails() {
    let mut meta = GadgetMetadata::from_yaml(DNS_METADATA.as_bytes()).unwrap();
    meta.name.clear();
    let err = meta.validate(&dns_program()).unwrap_err();
    assert!(err.to_string().contains("name is required"));
}

#[test]
fn test_unknown_struct_field_fails() {
    let mut meta = GadgetMetadata::from_yaml(DNS_METADATA.as_bytes()).unwrap();
    meta.structs
        .get_mut("event_dns")
        .unwrap()
        .fields
        .push(gadgetrun::metadata::StructField {
            name: "phantom".to_string(),
            ..Default::default()
        });
    let err = meta.validate(&dns_program()).unwrap_err();
    assert!(err.to_string().contains("phantom"));
}

#[test]
fn test_wrong_map_kind_fails() {
    let mut info = dns_program();
    info.maps.insert("events".to_string(), MapKind::Hash);
    let meta = GadgetMetadata::from_yaml(DNS_METADATA.as_bytes()).unwrap();
    let err = meta.validate(&info).unwrap_err();
    assert!(err.to_string().contains("wrong kind"));
}

#[test]
fn test_unknown_param_fails() {
    let mut info = dns_program();
    info.params.clear();
    let meta = GadgetMetadata::from_yaml(DNS_METADATA.as_bytes()).unwrap();
    let err = meta.validate(&info).unwrap_err();
    assert!(err.to_string().contains("targ_pid"));
}

#[test]
fn test_second_implementation_kind_fails() {
    let mut meta = GadgetMetadata::from_yaml(DNS_METADATA.as_bytes()).unwrap();
    meta.snapshotters.insert(
        "sockets".to_string(),
        gadgetrun::metadata::Snapshotter {
            struct_name: "event_dns".to_string(),
        },
    );
    let err = meta.validate(&dns_program()).unwrap_err();
    assert!(err.to_string().contains("only one of"));
}

// =============================================================================
// Population Tests
// =============================================================================

#[test]
fn test_populate_from_scratch() {
    let mut meta = GadgetMetadata {
        name: "trace_dns".to_string(),
        ..Default::default()
    };
    meta.populate(&dns_program()).unwrap();

    assert_eq!(meta.tracers["dns"].map_name, "events");
    let fields = &meta.structs["event_dns"].fields;
    assert_eq!(fields.len(), 4);

    let width = |name: &str| {
        fields
            .iter()
            .find(|f| f.name == name)
            .unwrap()
            .attributes
            .width
    };
    assert_eq!(width("pid"), 10, "u32 renders in 10 columns");
    assert_eq!(width("qtype"), 5, "u16 renders in 5 columns");
    assert_eq!(width("latency"), 20, "u64 renders in 20 columns");

    assert!(meta.ebpf_params.contains_key("targ_pid"));

    // populated documents validate
    meta.validate(&dns_program()).unwrap();
}

#[test]
fn test_populate_topper_uses_map_value_type() {
    let mut info = ProgramInfo::default();
    info.maps.insert("counts".to_string(), MapKind::Hash);
    info.map_value_types
        .insert("counts".to_string(), "io_stat".to_string());
    info.structs.insert(
        "io_stat".to_string(),
        vec![TypeField::new("bytes", FieldKind::Uint64)],
    );
    info.identifiers
        .push("gadget_topper_blockio___counts".to_string());

    let mut meta = GadgetMetadata {
        name: "top_blockio".to_string(),
        ..Default::default()
    };
    meta.populate(&info).unwrap();
    assert_eq!(meta.toppers["blockio"].struct_name, "io_stat");
    assert_eq!(meta.structs["io_stat"].fields.len(), 1);
}

#[test]
fn test_populate_rejects_missing_tracer_map() {
    let mut info = dns_program();
    info.maps.clear();
    let mut meta = GadgetMetadata::default();
    let err = meta.populate(&info).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Metadata);
}

#[test]
fn test_populate_is_idempotent() {
    let mut meta = GadgetMetadata {
        name: "trace_dns".to_string(),
        ..Default::default()
    };
    meta.populate(&dns_program()).unwrap();
    let once = meta.structs["event_dns"].clone();
    meta.populate(&dns_program()).unwrap();
    let twice: &StructMeta = &meta.structs["event_dns"];
    assert_eq!(&once, twice, "repopulating adds nothing");
}

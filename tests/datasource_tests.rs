//! Tests for the data-source bus.
//!
//! Validates priority-ordered delivery, schema freezing, typed field
//! round-trips, record pooling and per-source emission serialization.

use gadgetrun::{
    DataSourceKind, Error, ErrorKind, FieldKind, FieldValue, GadgetContext, OperatorRegistry,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

fn ctx() -> Arc<GadgetContext> {
    GadgetContext::new("ghcr.io/gadget/test:latest", Arc::new(OperatorRegistry::new()))
}

// =============================================================================
// Registration Tests
// =============================================================================

#[test]
fn test_register_and_enumerate_sources() {
    let ctx = ctx();
    ctx.register_data_source(DataSourceKind::EventStream, "dns")
        .unwrap();
    ctx.register_data_source(DataSourceKind::Snapshot, "sockets")
        .unwrap();

    let sources = ctx.data_sources();
    assert_eq!(sources.len(), 2);
    assert_eq!(sources["dns"].kind(), DataSourceKind::EventStream);
    assert_eq!(sources["sockets"].kind(), DataSourceKind::Snapshot);
}

#[test]
fn test_duplicate_source_name_is_rejected() {
    let ctx = ctx();
    ctx.register_data_source(DataSourceKind::EventStream, "dns")
        .unwrap();
    let err = ctx
        .register_data_source(DataSourceKind::EventStream, "dns")
        .unwrap_err();
    assert!(matches!(err, Error::DataSourceExists(_)));
    assert_eq!(err.kind(), ErrorKind::Abi);
}

// =============================================================================
// Field Round-Trip Tests
// =============================================================================

#[test]
fn test_every_scalar_kind_round_trips() {
    let ctx = ctx();
    let ds = ctx
        .register_data_source(DataSourceKind::EventStream, "kinds")
        .unwrap();

    let cases = vec![
        ("i8", FieldValue::Int8(-12)),
        ("i16", FieldValue::Int16(-1234)),
        ("i32", FieldValue::Int32(-123456)),
        ("i64", FieldValue::Int64(i64::MIN)),
        ("u8", FieldValue::Uint8(255)),
        ("u16", FieldValue::Uint16(65535)),
        ("u32", FieldValue::Uint32(4_000_000_000)),
        ("u64", FieldValue::Uint64(u64::MAX)),
        ("f32", FieldValue::Float32(1.5)),
        ("f64", FieldValue::Float64(-2.25)),
    ];

    let mut accessors = Vec::new();
    for (name, value) in &cases {
        accessors.push(ds.add_field(name, value.kind()).unwrap());
    }

    let data = ds.new_data();
    for (accessor, (_, value)) in accessors.iter().zip(&cases) {
        accessor.set_value(&data, value.clone()).unwrap();
    }
    for (accessor, (name, value)) in accessors.iter().zip(&cases) {
        assert_eq!(&accessor.value(&data).unwrap(), value, "field {}", name);
    }
}

#[test]
fn test_string_field_round_trips_any_utf8() {
    let ctx = ctx();
    let ds = ctx
        .register_data_source(DataSourceKind::EventStream, "strings")
        .unwrap();
    let acc = ds.add_field("comm", FieldKind::String).unwrap();
    let data = ds.new_data();

    for value in ["", "cat", "inspektor-gadget.io", "προφίλ", "日本語テキスト"] {
        acc.set_string(&data, value).unwrap();
        assert_eq!(acc.string(&data), value);
    }
}

#[test]
fn test_static_string_obeys_size_bound() {
    let ctx = ctx();
    let ds = ctx
        .register_data_source(DataSourceKind::EventStream, "tasks")
        .unwrap();
    let acc = ds.add_field_sized("comm", FieldKind::CString, 16).unwrap();
    let data = ds.new_data();

    acc.set_string(&data, "short").unwrap();
    assert_eq!(acc.string(&data), "short");

    let err = acc
        .set_string(&data, "a-name-that-is-way-too-long")
        .unwrap_err();
    assert!(matches!(err, Error::StringTooLong { .. }));
    assert_eq!(acc.string(&data), "short", "failed write leaves field intact");
}

// =============================================================================
// Priority Ordering Tests
// =============================================================================

#[test]
fn test_priority_chain_sees_mutations_in_order() {
    let ctx = ctx();
    let ds = ctx
        .register_data_source(DataSourceKind::EventStream, "open")
        .unwrap();
    let fname = ds.add_field("fname", FieldKind::String).unwrap();
    let observed = Arc::new(Mutex::new(Vec::new()));

    {
        let fname = fname.clone();
        ds.subscribe(
            move |_, data| {
                fname.set_string(data, "A").unwrap();
                Ok(())
            },
            10,
        )
        .unwrap();
    }
    {
        let fname = fname.clone();
        let observed = Arc::clone(&observed);
        ds.subscribe(
            move |_, data| {
                observed.lock().unwrap().push(fname.string(data));
                fname.set_string(data, "B").unwrap();
                Ok(())
            },
            20,
        )
        .unwrap();
    }
    {
        let fname = fname.clone();
        let observed = Arc::clone(&observed);
        ds.subscribe(
            move |_, data| {
                observed.lock().unwrap().push(fname.string(data));
                Ok(())
            },
            30,
        )
        .unwrap();
    }

    ds.emit_and_release(ds.new_data()).unwrap();
    assert_eq!(*observed.lock().unwrap(), vec!["A", "B"]);
}

#[test]
fn test_negative_priority_runs_first() {
    let ctx = ctx();
    let ds = ctx
        .register_data_source(DataSourceKind::EventStream, "open")
        .unwrap();
    let order = Arc::new(Mutex::new(Vec::new()));

    for (label, prio) in [("sink", 1000), ("enrich", 0), ("oci", -1000)] {
        let order = Arc::clone(&order);
        ds.subscribe(
            move |_, _| {
                order.lock().unwrap().push(label);
                Ok(())
            },
            prio,
        )
        .unwrap();
    }

    ds.emit_and_release(ds.new_data()).unwrap();
    assert_eq!(*order.lock().unwrap(), vec!["oci", "enrich", "sink"]);
}

// =============================================================================
// Freeze Tests
// =============================================================================

#[test]
fn test_first_emit_freezes_schema() {
    let ctx = ctx();
    let ds = ctx
        .register_data_source(DataSourceKind::EventStream, "open")
        .unwrap();
    ds.add_field("pid", FieldKind::Uint32).unwrap();

    assert!(!ds.is_frozen());
    ds.emit_and_release(ds.new_data()).unwrap();
    assert!(ds.is_frozen());

    let err = ds.add_field("late", FieldKind::Uint32).unwrap_err();
    assert!(matches!(err, Error::SchemaFrozen(_)));
    assert_eq!(err.kind(), ErrorKind::Abi);
}

// =============================================================================
// Error Propagation Tests
// =============================================================================

#[test]
fn test_subscriber_error_continues_and_returns_first() {
    let ctx = ctx();
    let ds = ctx
        .register_data_source(DataSourceKind::EventStream, "open")
        .unwrap();
    let calls = Arc::new(AtomicUsize::new(0));

    for prio in [10, 20, 30] {
        let calls = Arc::clone(&calls);
        ds.subscribe(
            move |_, _| {
                calls.fetch_add(1, Ordering::SeqCst);
                if prio == 10 {
                    Err(Error::BadHandle(prio as u32))
                } else {
                    Ok(())
                }
            },
            prio,
        )
        .unwrap();
    }

    let err = ds.emit_and_release(ds.new_data()).unwrap_err();
    assert!(matches!(err, Error::BadHandle(10)), "first error wins");
    assert_eq!(calls.load(Ordering::SeqCst), 3, "all subscribers ran");
}

#[test]
fn test_emit_without_subscribers_recycles_record() {
    let ctx = ctx();
    let ds = ctx
        .register_data_source(DataSourceKind::EventStream, "quiet")
        .unwrap();
    let acc = ds.add_field("v", FieldKind::Uint64).unwrap();

    for round in 0..10u64 {
        let data = ds.new_data();
        assert_eq!(acc.uint64(&data), 0, "pooled record is zeroed");
        acc.set_uint64(&data, round);
        ds.emit_and_release(data).unwrap();
    }
}

// =============================================================================
// Concurrency Tests
// =============================================================================

#[test]
fn test_emissions_on_one_source_are_serialized() {
    let ctx = ctx();
    let ds = ctx
        .register_data_source(DataSourceKind::EventStream, "busy")
        .unwrap();
    let acc = ds.add_field("v", FieldKind::Uint64).unwrap();

    let in_flight = Arc::new(AtomicUsize::new(0));
    let max_seen = Arc::new(AtomicUsize::new(0));
    let total = Arc::new(AtomicUsize::new(0));
    {
        let in_flight = Arc::clone(&in_flight);
        let max_seen = Arc::clone(&max_seen);
        let total = Arc::clone(&total);
        ds.subscribe(
            move |_, _| {
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                std::thread::yield_now();
                in_flight.fetch_sub(1, Ordering::SeqCst);
                total.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
            0,
        )
        .unwrap();
    }

    let threads: Vec<_> = (0..4)
        .map(|t| {
            let ds = Arc::clone(&ds);
            let acc = acc.clone();
            std::thread::spawn(move || {
                for i in 0..50u64 {
                    let data = ds.new_data();
                    acc.set_uint64(&data, t * 1000 + i);
                    ds.emit_and_release(data).unwrap();
                }
            })
        })
        .collect();
    for thread in threads {
        thread.join().unwrap();
    }

    assert_eq!(total.load(Ordering::SeqCst), 200);
    assert_eq!(
        max_seen.load(Ordering::SeqCst),
        1,
        "no two emissions overlap on one source"
    );
}

#[test]
fn test_subscriber_may_reemit_on_same_source() {
    let ctx = ctx();
    let ds = ctx
        .register_data_source(DataSourceKind::EventStream, "chain")
        .unwrap();
    let acc = ds.add_field("depth", FieldKind::Uint32).unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));

    {
        let ds_inner = Arc::clone(&ds);
        let acc = acc.clone();
        let seen = Arc::clone(&seen);
        ds.subscribe(
            move |_, data| {
                let depth = acc.uint32(data);
                seen.lock().unwrap().push(depth);
                if depth < 3 {
                    let next = ds_inner.new_data();
                    acc.set_uint32(&next, depth + 1);
                    // recursion must not deadlock the emit lock
                    ds_inner.emit_and_release(next)?;
                }
                Ok(())
            },
            0,
        )
        .unwrap();
    }

    ds.emit_and_release(ds.new_data()).unwrap();
    assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2, 3]);
}

// =============================================================================
// Cancellation Tests
// =============================================================================

#[test]
fn test_cancellation_refuses_new_subscriptions() {
    let ctx = ctx();
    let ds = ctx
        .register_data_source(DataSourceKind::EventStream, "open")
        .unwrap();
    ctx.cancel();

    let err = ds.subscribe(|_, _| Ok(()), 0).unwrap_err();
    assert!(matches!(err, Error::Cancelled));
    assert!(matches!(
        ctx.register_data_source(DataSourceKind::EventStream, "late"),
        Err(Error::Cancelled)
    ));
}

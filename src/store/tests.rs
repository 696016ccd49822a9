use std::path::PathBuf;

use ulid::Ulid;

use super::*;

const T0: Ms = 1_714_521_600_000;
const H: Ms = 3_600_000;

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("kinedesk_test_store");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

fn new_material(name: &str, total_qty: u32) -> NewMaterial {
    NewMaterial {
        id: Ulid::new(),
        name: name.into(),
        description: None,
        total_qty,
    }
}

fn new_loan(material_id: Ulid, patient_id: Ulid, qty: u32) -> NewLoan {
    NewLoan {
        id: Ulid::new(),
        material_id,
        patient_id,
        practitioner_id: Ulid::new(),
        qty,
        notes: None,
        loaned_at: now_ms(),
    }
}

fn new_appointment(practitioner_id: Ulid, start: Ms, end: Ms) -> NewAppointment {
    NewAppointment {
        id: Ulid::new(),
        practitioner_id,
        patient_id: Ulid::new(),
        span: Span::new(start, end),
        notes: None,
    }
}

#[tokio::test]
async fn decrement_is_conditional() {
    let store = Store::in_memory();
    let m = store.insert_material(new_material("Band", 3)).await.unwrap();

    assert!(store.decrement_available(m.id, 2).await.unwrap());
    assert!(!store.decrement_available(m.id, 2).await.unwrap());
    assert_eq!(store.get_material(m.id).await.unwrap().unwrap().available_qty, 1);
    assert!(!store.decrement_available(Ulid::new(), 1).await.unwrap());
}

#[tokio::test]
async fn mark_returned_is_conditional() {
    let store = Store::in_memory();
    let m = store.insert_material(new_material("Band", 3)).await.unwrap();
    let loan = store.insert_loan(new_loan(m.id, Ulid::new(), 1)).await.unwrap();

    assert!(store.mark_returned(loan.id, T0).await.unwrap());
    assert!(!store.mark_returned(loan.id, T0 + 1).await.unwrap());
    let stored = store.get_loan(loan.id).await.unwrap().unwrap();
    assert_eq!(stored.returned_at, Some(T0));
    assert!(!store.mark_returned(Ulid::new(), T0).await.unwrap());
}

#[tokio::test]
async fn material_names_unique_and_case_sensitive() {
    let store = Store::in_memory();
    store.insert_material(new_material("Band", 1)).await.unwrap();
    let dup = store.insert_material(new_material("Band", 2)).await;
    assert_eq!(dup, Err(StoreError::UniqueViolation("materials.name")));
    store.insert_material(new_material("band", 1)).await.unwrap();
}

#[tokio::test]
async fn loan_needs_existing_material() {
    let store = Store::in_memory();
    let r = store.insert_loan(new_loan(Ulid::new(), Ulid::new(), 1)).await;
    assert_eq!(r, Err(StoreError::MissingReference("loans.material_id")));
}

#[tokio::test]
async fn snapshot_counts_active_loans_only() {
    let store = Store::in_memory();
    let m = store.insert_material(new_material("Crutches", 10)).await.unwrap();
    let a = store.insert_loan(new_loan(m.id, Ulid::new(), 3)).await.unwrap();
    store.insert_loan(new_loan(m.id, Ulid::new(), 4)).await.unwrap();
    let (row, outstanding) = store.stock_snapshot(m.id).await.unwrap().unwrap();
    assert_eq!(row.id, m.id);
    assert_eq!(outstanding, 7);
    store.mark_returned(a.id, T0).await.unwrap();
    assert_eq!(store.stock_snapshot(m.id).await.unwrap().unwrap().1, 4);
    assert_eq!(store.stock_snapshot(Ulid::new()).await.unwrap(), None);
}

#[tokio::test]
async fn overlap_ignores_cancelled_and_excluded() {
    let store = Store::in_memory();
    let p = Ulid::new();
    let a = store
        .insert_appointment(new_appointment(p, T0 + 9 * H, T0 + 10 * H))
        .await
        .unwrap();
    let probe = Span::new(T0 + 9 * H, T0 + 9 * H + 1);

    assert_eq!(store.find_overlap(p, probe, None).await.unwrap(), Some(a.id));
    assert_eq!(store.find_overlap(p, probe, Some(a.id)).await.unwrap(), None);
    assert_eq!(store.find_overlap(Ulid::new(), probe, None).await.unwrap(), None);

    store
        .set_appointment_status(a.id, AppointmentStatus::Cancelled, None)
        .await
        .unwrap();
    assert_eq!(store.find_overlap(p, probe, None).await.unwrap(), None);
}

#[tokio::test]
async fn updates_to_missing_appointment_return_none() {
    let store = Store::in_memory();
    let id = Ulid::new();
    assert!(store.reschedule_appointment(id, Span::new(T0, T0 + H)).await.unwrap().is_none());
    assert!(store.set_appointment_notes(id, None).await.unwrap().is_none());
}

#[tokio::test]
async fn journaled_state_survives_reopen() {
    let path = test_wal_path("reopen.wal");
    let p = Ulid::new();
    let patient = Ulid::new();
    let (appointment_id, material_id, returned_id, active_id) = {
        let store = Store::open(&path).unwrap();
        let a = store
            .insert_appointment(new_appointment(p, T0 + 9 * H, T0 + 10 * H))
            .await
            .unwrap();
        store
            .reschedule_appointment(a.id, Span::new(T0 + 11 * H, T0 + 12 * H))
            .await
            .unwrap();
        store
            .set_appointment_status(a.id, AppointmentStatus::Cancelled, Some("ill".into()))
            .await
            .unwrap();

        let m = store.insert_material(new_material("Walker", 5)).await.unwrap();
        store.decrement_available(m.id, 2).await.unwrap();
        let returned = store.insert_loan(new_loan(m.id, patient, 2)).await.unwrap();
        store.mark_returned(returned.id, T0).await.unwrap();
        store.increment_available(m.id, 2).await.unwrap();
        store.decrement_available(m.id, 1).await.unwrap();
        let active = store.insert_loan(new_loan(m.id, patient, 1)).await.unwrap();
        (a.id, m.id, returned.id, active.id)
    };

    let store = Store::open(&path).unwrap();
    let a = store.get_appointment(appointment_id).await.unwrap().unwrap();
    assert_eq!(a.span, Span::new(T0 + 11 * H, T0 + 12 * H));
    assert_eq!(a.status, AppointmentStatus::Cancelled);
    assert_eq!(a.cancelled_reason.as_deref(), Some("ill"));

    let m = store.get_material(material_id).await.unwrap().unwrap();
    assert_eq!(m.available_qty, 4);
    assert_eq!(store.get_loan(returned_id).await.unwrap().unwrap().returned_at, Some(T0));
    let active = store.list_loans_by_patient(patient, true, 50).await.unwrap();
    assert_eq!(active.iter().map(|l| l.id).collect::<Vec<_>>(), vec![active_id]);

    // The name index is rebuilt too.
    let dup = store.insert_material(new_material("Walker", 1)).await;
    assert_eq!(dup, Err(StoreError::UniqueViolation("materials.name")));
}

#[tokio::test]
async fn compaction_preserves_state() {
    let path = test_wal_path("compact.wal");
    let material_id = {
        let store = Store::open(&path).unwrap();
        let m = store.insert_material(new_material("Balance board", 3)).await.unwrap();
        for _ in 0..3 {
            store.decrement_available(m.id, 1).await.unwrap();
            store.increment_available(m.id, 1).await.unwrap();
        }
        store.decrement_available(m.id, 1).await.unwrap();
        store.insert_loan(new_loan(m.id, Ulid::new(), 1)).await.unwrap();
        assert_eq!(store.appends_since_compact().await, 9);

        let before = std::fs::metadata(&path).unwrap().len();
        store.compact().await.unwrap();
        assert_eq!(store.appends_since_compact().await, 0);
        assert!(std::fs::metadata(&path).unwrap().len() < before);

        // Appends after compaction land in the new log.
        store.insert_material(new_material("Foam roller", 1)).await.unwrap();
        m.id
    };

    let store = Store::open(&path).unwrap();
    let m = store.get_material(material_id).await.unwrap().unwrap();
    assert_eq!(m.available_qty, 2);
    assert_eq!(store.stock_snapshot(material_id).await.unwrap().unwrap().1, 1);
    assert_eq!(store.list_materials(50).await.unwrap().len(), 2);
}

use dropbox_core::db::open_db_in_memory;
use dropbox_core::{
    AccessLevel, BoxStore, BoxTransition, CloseReason, DropBox, Membership, OpenBoxQuery,
    RepoError, SqliteBoxStore, Submission,
};
use rusqlite::Connection;
use uuid::Uuid;

fn setup() -> Connection {
    open_db_in_memory().unwrap()
}

fn message(text: &str) -> Submission {
    Submission::new().with_field("message", text)
}

#[test]
fn insert_and_get_roundtrip_resolves_owner_membership() {
    let conn = setup();
    let store = SqliteBoxStore::try_new(&conn).unwrap();
    let owner = Uuid::new_v4();

    let drop_box = DropBox::new(owner, 1_000, 5_000);
    store.insert_box(&drop_box).unwrap();

    let loaded = store.get_box(drop_box.id).unwrap().unwrap();
    assert_eq!(loaded, drop_box);
    assert_eq!(loaded.memberships.len(), 1);
    assert_eq!(loaded.memberships[0].principal, owner);
    assert_eq!(loaded.memberships[0].access, AccessLevel::Full);
}

#[test]
fn get_missing_box_returns_none() {
    let conn = setup();
    let store = SqliteBoxStore::try_new(&conn).unwrap();
    assert!(store.get_box(Uuid::new_v4()).unwrap().is_none());
}

#[test]
fn invalid_box_is_rejected_before_any_write() {
    let conn = setup();
    let store = SqliteBoxStore::try_new(&conn).unwrap();

    let mut orphan = DropBox::new(Uuid::new_v4(), 1_000, 5_000);
    orphan.memberships.clear();
    let err = store.insert_box(&orphan).unwrap_err();
    assert!(matches!(err, RepoError::Validation(_)));

    let inverted = DropBox::new(Uuid::new_v4(), 5_000, 1_000);
    assert!(matches!(
        store.insert_box(&inverted).unwrap_err(),
        RepoError::Validation(_)
    ));

    let rows: i64 = conn
        .query_row("SELECT COUNT(*) FROM boxes;", [], |row| row.get(0))
        .unwrap();
    assert_eq!(rows, 0);
}

#[test]
fn duplicate_box_id_leaves_original_intact() {
    let conn = setup();
    let store = SqliteBoxStore::try_new(&conn).unwrap();
    let drop_box = DropBox::new(Uuid::new_v4(), 1_000, 5_000);
    store.insert_box(&drop_box).unwrap();

    let duplicate = DropBox::with_id(drop_box.id, Uuid::new_v4(), 2_000, 6_000);
    assert!(matches!(
        store.insert_box(&duplicate).unwrap_err(),
        RepoError::Db(_)
    ));

    let memberships = store.list_memberships(drop_box.id).unwrap();
    assert_eq!(memberships.len(), 1);
    assert_eq!(memberships[0].principal, drop_box.owner);
}

#[test]
fn close_if_open_applies_once() {
    let conn = setup();
    let store = SqliteBoxStore::try_new(&conn).unwrap();
    let drop_box = DropBox::new(Uuid::new_v4(), 1_000, 5_000);
    store.insert_box(&drop_box).unwrap();

    let first = BoxTransition::Submit {
        at: 2_000,
        submission: message("first"),
    };
    let second = BoxTransition::Submit {
        at: 2_001,
        submission: message("second"),
    };
    assert!(store.close_if_open(drop_box.id, &first).unwrap());
    assert!(!store.close_if_open(drop_box.id, &second).unwrap());
    assert!(!store
        .close_if_open(drop_box.id, &BoxTransition::Expire { at: 9_000 })
        .unwrap());

    let loaded = store.get_box(drop_box.id).unwrap().unwrap();
    assert!(loaded.closed);
    assert_eq!(loaded.closed_reason, Some(CloseReason::Submitted));
    assert_eq!(loaded.closed_at, Some(2_000));
    assert_eq!(loaded.submission, Some(message("first")));
}

#[test]
fn close_if_open_respects_expiry_preconditions() {
    let conn = setup();
    let store = SqliteBoxStore::try_new(&conn).unwrap();
    let drop_box = DropBox::new(Uuid::new_v4(), 1_000, 5_000);
    store.insert_box(&drop_box).unwrap();

    assert!(!store
        .close_if_open(drop_box.id, &BoxTransition::Expire { at: 5_000 })
        .unwrap());
    assert!(!store
        .close_if_open(
            drop_box.id,
            &BoxTransition::Submit {
                at: 5_001,
                submission: message("late"),
            },
        )
        .unwrap());
    assert!(store.get_box(drop_box.id).unwrap().unwrap().is_open());

    assert!(store
        .close_if_open(drop_box.id, &BoxTransition::Expire { at: 5_001 })
        .unwrap());
    let loaded = store.get_box(drop_box.id).unwrap().unwrap();
    assert_eq!(loaded.closed_reason, Some(CloseReason::Expired));
    assert!(loaded.submission.is_none());
}

#[test]
fn close_if_open_on_missing_box_reports_false() {
    let conn = setup();
    let store = SqliteBoxStore::try_new(&conn).unwrap();
    assert!(!store
        .close_if_open(Uuid::new_v4(), &BoxTransition::Expire { at: 1 })
        .unwrap());
}

#[test]
fn delete_owned_box_requires_owner_and_cascades() {
    let conn = setup();
    let store = SqliteBoxStore::try_new(&conn).unwrap();
    let owner = Uuid::new_v4();
    let member = Uuid::new_v4();
    let drop_box = DropBox::new(owner, 1_000, 5_000);
    store.insert_box(&drop_box).unwrap();
    store
        .put_membership(&Membership::new(drop_box.id, member, AccessLevel::Full, 1_500))
        .unwrap();

    assert!(!store.delete_owned_box(member, drop_box.id).unwrap());
    assert!(store.get_box(drop_box.id).unwrap().is_some());

    assert!(store.delete_owned_box(owner, drop_box.id).unwrap());
    assert!(store.get_box(drop_box.id).unwrap().is_none());
    assert!(store.list_memberships(drop_box.id).unwrap().is_empty());
    assert!(!store.delete_owned_box(owner, drop_box.id).unwrap());
}

#[test]
fn memberships_list_owner_first() {
    let conn = setup();
    let store = SqliteBoxStore::try_new(&conn).unwrap();
    let owner = Uuid::new_v4();
    let drop_box = DropBox::new(owner, 1_000, 5_000);
    store.insert_box(&drop_box).unwrap();

    let member = Uuid::new_v4();
    store
        .put_membership(&Membership::new(drop_box.id, member, AccessLevel::Full, 500))
        .unwrap();

    let memberships = store.list_memberships(drop_box.id).unwrap();
    let principals: Vec<Uuid> = memberships.iter().map(|m| m.principal).collect();
    assert_eq!(principals, vec![owner, member]);
}

#[test]
fn put_membership_on_missing_box_fails() {
    let conn = setup();
    let store = SqliteBoxStore::try_new(&conn).unwrap();
    let err = store
        .put_membership(&Membership::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            AccessLevel::Full,
            0,
        ))
        .unwrap_err();
    assert!(matches!(err, RepoError::Db(_)));
}

#[test]
fn list_open_by_owner_pages_in_creation_order() {
    let conn = setup();
    let store = SqliteBoxStore::try_new(&conn).unwrap();
    let owner = Uuid::new_v4();
    let stranger = Uuid::new_v4();

    let mut created = Vec::new();
    for index in 0..5 {
        // Identical timestamps: order must come from insertion, not time.
        let drop_box = DropBox::new(owner, 1_000, 9_000 + index);
        store.insert_box(&drop_box).unwrap();
        created.push(drop_box.id);
    }
    store
        .insert_box(&DropBox::new(stranger, 1_000, 9_000))
        .unwrap();
    store
        .close_if_open(
            created[1],
            &BoxTransition::Submit {
                at: 2_000,
                submission: message("done"),
            },
        )
        .unwrap();

    let first = store
        .list_open_by_owner(
            owner,
            &OpenBoxQuery {
                after: None,
                limit: Some(2),
            },
        )
        .unwrap();
    assert_eq!(
        first.items.iter().map(|b| b.id).collect::<Vec<_>>(),
        vec![created[0], created[2]]
    );
    assert!(first.next.is_some());

    let second = store
        .list_open_by_owner(
            owner,
            &OpenBoxQuery {
                after: first.next,
                limit: Some(2),
            },
        )
        .unwrap();
    assert_eq!(
        second.items.iter().map(|b| b.id).collect::<Vec<_>>(),
        vec![created[3], created[4]]
    );

    let third = store
        .list_open_by_owner(
            owner,
            &OpenBoxQuery {
                after: second.next,
                limit: Some(2),
            },
        )
        .unwrap();
    assert!(third.items.is_empty());
    assert!(third.next.is_none());
}

#[test]
fn close_expired_only_touches_overdue_open_boxes() {
    let conn = setup();
    let store = SqliteBoxStore::try_new(&conn).unwrap();
    let owner = Uuid::new_v4();

    let overdue = DropBox::new(owner, 1_000, 2_000);
    let fresh = DropBox::new(owner, 1_000, 9_000);
    store.insert_box(&overdue).unwrap();
    store.insert_box(&fresh).unwrap();

    assert_eq!(store.close_expired(3_000).unwrap(), 1);
    assert_eq!(store.close_expired(3_000).unwrap(), 0);
    assert!(store.get_box(overdue.id).unwrap().unwrap().closed);
    assert!(store.get_box(fresh.id).unwrap().unwrap().is_open());
}

#[test]
fn corrupt_submission_is_reported_instead_of_masked() {
    let conn = setup();
    let store = SqliteBoxStore::try_new(&conn).unwrap();
    let drop_box = DropBox::new(Uuid::new_v4(), 1_000, 5_000);
    store.insert_box(&drop_box).unwrap();
    conn.execute(
        "UPDATE boxes
         SET closed = 1, closed_at = 2000, closed_reason = 'submitted', submission = 'not json'
         WHERE id = ?1;",
        [drop_box.id.to_string()],
    )
    .unwrap();

    let err = store.get_box(drop_box.id).unwrap_err();
    assert!(matches!(err, RepoError::InvalidData(_)));
}

#[test]
fn store_requires_migrated_connection() {
    let conn = Connection::open_in_memory().unwrap();
    let err = SqliteBoxStore::try_new(&conn).err().unwrap();
    assert!(matches!(
        err,
        RepoError::UninitializedConnection {
            actual_version: 0,
            ..
        }
    ));
}

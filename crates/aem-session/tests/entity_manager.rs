//! End-to-end behavior of the entity manager over in-memory adapters.

use aem_core::{
    AdapterCall, ClassMetadata, Criteria, Email, EntityDataAdapter, EntityRef, Error, FieldMapping,
    FieldType, Identifier, LifecycleEvent, MappingErrorKind, MemoryAdapter, Money, OrderBy, Result,
    Row, StateErrorKind, TransactionalConnection, Value,
};
use aem_session::{EntityEventKind, EntityManager, EntityManagerConfig};
use chrono::{DateTime, TimeZone, Utc};
use std::sync::{Arc, Mutex};
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[derive(Debug, Default)]
struct Product {
    id: Option<i64>,
    active: bool,
    created_at: Option<DateTime<Utc>>,
    name: String,
    price: f64,
    nickname: Option<String>,
    loads: u32,
}

aem_core::entity!(Product, "Product" { id, active, created_at, name, price, nickname });

fn product(name: &str, price: f64) -> EntityRef<Product> {
    EntityRef::new(Product {
        name: name.to_string(),
        price,
        ..Product::default()
    })
}

fn product_metadata() -> ClassMetadata {
    ClassMetadata::builder_for::<Product>()
        .id(FieldMapping::new("id", FieldType::Integer))
        .field(FieldMapping::new("active", FieldType::Boolean))
        .field(FieldMapping::new("created_at", FieldType::DateTime).nullable(true))
        .field(FieldMapping::new("name", FieldType::String))
        .field(FieldMapping::new("price", FieldType::Float).column("unit_price"))
        .field(FieldMapping::new("nickname", FieldType::String).nullable(true))
        .build()
        .unwrap()
}

fn stored_product(id: i64, name: &str, price: f64) -> Row {
    Row::new()
        .with("id", id)
        .with("active", false)
        .with("name", name)
        .with("unit_price", price)
}

/// Connection that records the transaction calls it receives.
#[derive(Default)]
struct RecordingConnection {
    log: Mutex<Vec<&'static str>>,
    fail_begin: bool,
}

impl RecordingConnection {
    fn log(&self) -> Vec<&'static str> {
        self.log.lock().unwrap().clone()
    }

    fn push(&self, call: &'static str) {
        self.log.lock().unwrap().push(call);
    }
}

impl TransactionalConnection for RecordingConnection {
    fn begin_transaction(&self) -> Result<()> {
        self.push("begin");
        if self.fail_begin {
            return Err(Error::Custom("connection refused".into()));
        }
        Ok(())
    }

    fn commit_transaction(&self) -> Result<()> {
        self.push("commit");
        Ok(())
    }

    fn rollback_transaction(&self) -> Result<()> {
        self.push("rollback");
        Ok(())
    }
}

struct Fixture {
    em: EntityManager,
    products: Arc<MemoryAdapter>,
    connection: Arc<RecordingConnection>,
}

fn fixture_with(config: EntityManagerConfig, metadata: ClassMetadata) -> Fixture {
    init_tracing();
    let products = Arc::new(MemoryAdapter::new("products", ["id"]));
    let connection = Arc::new(RecordingConnection::default());
    let em = EntityManager::builder()
        .config(config)
        .entity::<Product>(metadata, products.clone())
        .connection(connection.clone())
        .build()
        .unwrap();
    Fixture {
        em,
        products,
        connection,
    }
}

fn fixture() -> Fixture {
    fixture_with(EntityManagerConfig::default(), product_metadata())
}

#[test]
fn loaded_entity_without_changes_is_not_written() {
    let f = fixture();
    f.products.seed(stored_product(1, "lamp", 12.5));

    let lamp = f.em.find::<Product>(1).unwrap().unwrap();
    assert_eq!(lamp.read().name, "lamp");
    assert_eq!(lamp.read().price, 12.5);
    assert_eq!(lamp.read().created_at, None);

    f.em.flush().unwrap();
    assert_eq!(f.products.call_count("update"), 0);
    assert_eq!(f.connection.log(), vec!["begin", "commit"]);
}

#[test]
fn unknown_identifier_finds_nothing() {
    let f = fixture();
    assert!(f.em.find::<Product>(42).unwrap().is_none());
    assert_eq!(
        f.products.calls(),
        vec![AdapterCall::LoadById(Identifier::from([("id", 42_i64)]))]
    );
}

#[test]
fn persisted_entity_is_inserted_once_then_updated_when_changed() {
    let f = fixture();
    let desk = product("desk", 99.0);
    f.em.persist(&desk).unwrap();
    assert!(f.em.contains(&desk).unwrap());

    f.em.flush().unwrap();
    assert_eq!(desk.read().id, Some(1));
    assert_eq!(f.products.call_count("insert"), 1);
    match &f.products.calls()[0] {
        AdapterCall::Insert(row) => {
            assert!(!row.contains("id"));
            assert_eq!(row.get("unit_price"), Some(&Value::Float(99.0)));
            assert_eq!(row.get("nickname"), Some(&Value::Null));
        }
        other => panic!("expected an insert, got {other:?}"),
    }

    f.products.clear_calls();
    f.em.flush().unwrap();
    assert!(f.products.calls().is_empty());

    desk.write().active = true;
    f.em.flush().unwrap();
    let calls = f.products.calls();
    assert_eq!(calls.len(), 1);
    match &calls[0] {
        AdapterCall::Update(identifier, row) => {
            assert_eq!(identifier, &Identifier::from([("id", 1_i64)]));
            assert_eq!(row.get("active"), Some(&Value::Bool(true)));
        }
        other => panic!("expected an update, got {other:?}"),
    }
    assert_eq!(f.products.rows()[0].get("active"), Some(&Value::Bool(true)));
}

#[test]
fn persisting_twice_schedules_one_insert() {
    let f = fixture();
    let desk = product("desk", 99.0);
    f.em.persist(&desk).unwrap();
    f.em.persist(&desk).unwrap();
    f.em.flush().unwrap();
    assert_eq!(f.products.call_count("insert"), 1);

    f.em.persist(&desk).unwrap();
    f.em.flush().unwrap();
    assert_eq!(f.products.call_count("insert"), 1);
}

#[test]
fn insert_snapshot_matches_stored_row() {
    let f = fixture();
    let desk = product("desk", 99.0);
    f.em.persist(&desk).unwrap();
    f.em.flush().unwrap();

    let persister = f.em.persister::<Product>().unwrap();
    let snapshot = persister.snapshot(&desk).unwrap();
    assert_eq!(snapshot, f.products.rows()[0]);
    assert_eq!(snapshot.get("id"), Some(&Value::Int(1)));
}

#[test]
fn snapshot_advances_when_configured() {
    let f = fixture_with(
        EntityManagerConfig::new().advance_snapshot_on_update(true),
        product_metadata(),
    );
    f.products.seed(stored_product(1, "lamp", 12.5));
    let lamp = f.em.find::<Product>(1).unwrap().unwrap();

    lamp.write().price = 15.0;
    f.em.flush().unwrap();
    f.em.flush().unwrap();
    assert_eq!(f.products.call_count("update"), 1);
}

#[test]
fn snapshot_keeps_load_time_values_by_default() {
    let f = fixture();
    f.products.seed(stored_product(1, "lamp", 12.5));
    let lamp = f.em.find::<Product>(1).unwrap().unwrap();

    lamp.write().price = 15.0;
    f.em.flush().unwrap();
    f.em.flush().unwrap();
    assert_eq!(f.products.call_count("update"), 2);
}

#[test]
fn every_lookup_path_yields_the_same_instance() {
    let f = fixture();
    f.products.seed(stored_product(1, "lamp", 12.5));
    f.products.seed(stored_product(2, "chair", 40.0));

    let first = f.em.find::<Product>(1).unwrap().unwrap();
    let second = f.em.find::<Product>(1).unwrap().unwrap();
    assert!(first.ptr_eq(&second));

    let repository = f.em.repository::<Product>();
    let all = repository.find_all().unwrap();
    assert_eq!(all.len(), 2);
    assert!(all[0].ptr_eq(&first));

    let by_name = repository
        .find_one_by(&Criteria::from([("name", "lamp")]), None)
        .unwrap()
        .unwrap();
    assert!(by_name.ptr_eq(&first));
    assert_eq!(f.em.persister::<Product>().unwrap().updates().len(), 2);
}

#[test]
fn repository_maps_criteria_and_ordering_to_columns() {
    let f = fixture();
    for (id, name, price) in [(1, "lamp", 12.5), (2, "chair", 40.0), (3, "desk", 99.0), (4, "pen", 2.0)] {
        f.products.seed(stored_product(id, name, price));
    }

    let found = f
        .em
        .repository::<Product>()
        .find_by(
            &Criteria::from([(">=price", 10.0)]),
            Some(&OrderBy::new().desc("price")),
            Some(2),
            Some(1),
        )
        .unwrap();
    let names: Vec<String> = found.iter().map(|p| p.read().name.clone()).collect();
    assert_eq!(names, vec!["chair", "lamp"]);

    assert_eq!(
        f.products.calls(),
        vec![AdapterCall::LoadAll {
            criteria: Criteria::from([(">=unit_price", 10.0)]),
            order_by: Some(OrderBy::new().desc("unit_price")),
            limit: Some(2),
            offset: Some(1),
        }]
    );
}

#[test]
fn removed_entity_is_deleted_and_forgotten() {
    let f = fixture();
    f.products.seed(stored_product(1, "lamp", 12.5));
    let lamp = f.em.find::<Product>(1).unwrap().unwrap();

    f.em.remove(&lamp).unwrap();
    f.em.flush().unwrap();
    assert!(f.products.calls().contains(&AdapterCall::Delete(Identifier::from([("id", 1_i64)]))));
    assert!(f.products.rows().is_empty());
    assert!(!f.em.contains(&lamp).unwrap());
    assert!(f.em.find::<Product>(1).unwrap().is_none());
}

#[test]
fn removing_a_new_entity_cancels_its_insert() {
    let f = fixture();
    let desk = product("desk", 99.0);
    f.em.persist(&desk).unwrap();
    f.em.remove(&desk).unwrap();
    assert!(f.em.persister::<Product>().unwrap().inserts().is_empty());
    assert!(!f.em.contains(&desk).unwrap());

    f.em.flush().unwrap();
    assert!(f.products.calls().is_empty());
    assert_eq!(f.connection.log(), vec!["begin", "commit"]);

    let lamp = product("lamp", 12.5);
    f.em.persist(&lamp).unwrap();
    f.em.flush().unwrap();
    assert_eq!(f.products.call_count("insert"), 1);
    assert_eq!(f.products.call_count("delete"), 0);
    assert_eq!(lamp.read().id, Some(1));
}

#[test]
fn inserts_follow_persist_order() {
    let f = fixture();
    let older = product("older", 1.0);
    let newer = product("newer", 2.0);
    f.em.persist(&newer).unwrap();
    f.em.persist(&older).unwrap();
    f.em.flush().unwrap();

    let names: Vec<Value> = f
        .products
        .calls()
        .into_iter()
        .filter_map(|call| match call {
            AdapterCall::Insert(row) => row.get("name").cloned(),
            _ => None,
        })
        .collect();
    assert_eq!(names, vec![Value::from("newer"), Value::from("older")]);
    assert_eq!(newer.read().id, Some(1));
    assert_eq!(older.read().id, Some(2));
}

#[test]
fn detached_entity_is_left_alone() {
    let f = fixture();
    f.products.seed(stored_product(1, "lamp", 12.5));
    let lamp = f.em.find::<Product>(1).unwrap().unwrap();
    f.products.clear_calls();

    f.em.detach(&lamp).unwrap();
    assert!(f.products.calls().is_empty());
    assert!(!f.em.contains(&lamp).unwrap());

    lamp.write().name = "lantern".into();
    f.em.flush().unwrap();
    assert!(f.products.calls().is_empty());

    let reloaded = f.em.find::<Product>(1).unwrap().unwrap();
    assert!(!reloaded.ptr_eq(&lamp));
    assert_eq!(reloaded.read().name, "lamp");
}

#[test]
fn failed_write_rolls_back_exactly_once() {
    let f = fixture();
    f.products.seed(stored_product(1, "lamp", 12.5));
    let lamp = f.em.find::<Product>(1).unwrap().unwrap();
    f.products.fail_on("update", "disk full");

    lamp.write().active = true;
    let err = f.em.flush().unwrap_err();
    assert!(err.is_commit_failure());
    assert!(err.to_string().starts_with("Commit failed!"));
    assert!(matches!(err.cause(), Some(Error::Adapter(_))));
    assert_eq!(f.connection.log(), vec!["begin", "rollback"]);
}

#[test]
fn failed_begin_writes_nothing() {
    init_tracing();
    let products = Arc::new(MemoryAdapter::new("products", ["id"]));
    let connection = Arc::new(RecordingConnection {
        fail_begin: true,
        ..RecordingConnection::default()
    });
    let em = EntityManager::builder()
        .entity::<Product>(product_metadata(), products.clone())
        .connection(connection.clone())
        .build()
        .unwrap();

    em.persist(&product("desk", 99.0)).unwrap();
    let err = em.flush().unwrap_err();
    assert!(err.is_commit_failure());
    assert_eq!(products.call_count("insert"), 0);
    assert_eq!(connection.log(), vec!["begin"]);
}

#[test]
fn flush_without_connection_still_writes() {
    init_tracing();
    let products = Arc::new(MemoryAdapter::new("products", ["id"]));
    let em = EntityManager::builder()
        .entity::<Product>(product_metadata(), products.clone())
        .build()
        .unwrap();
    em.persist(&product("desk", 99.0)).unwrap();
    em.flush().unwrap();
    assert_eq!(products.rows().len(), 1);
    assert!(em.connection().is_none());
}

#[test]
fn composite_identifiers_are_resolved_by_field() {
    init_tracing();

    #[derive(Debug, Default)]
    struct Membership {
        user_id: i64,
        group_id: i64,
        role: String,
    }

    aem_core::entity!(Membership, "Membership" { user_id, group_id, role });

    let adapter = Arc::new(MemoryAdapter::new("memberships", ["user_id", "group_id"]));
    adapter.seed(
        Row::new()
            .with("user_id", 1)
            .with("group_id", 2)
            .with("role", "owner"),
    );
    let metadata = ClassMetadata::builder_for::<Membership>()
        .id(FieldMapping::new("user_id", FieldType::Integer))
        .id(FieldMapping::new("group_id", FieldType::Integer))
        .field(FieldMapping::new("role", FieldType::String))
        .build()
        .unwrap();
    let em = EntityManager::builder()
        .entity::<Membership>(metadata, adapter)
        .build()
        .unwrap();

    let id = Row::from([("group_id", 2_i64), ("user_id", 1_i64)]);
    let membership = em.find::<Membership>(id.clone()).unwrap().unwrap();
    assert_eq!(membership.read().role, "owner");
    assert!(membership.ptr_eq(&em.find::<Membership>(id).unwrap().unwrap()));

    let err = em.find::<Membership>(1).unwrap_err();
    assert_eq!(err.mapping_kind(), Some(MappingErrorKind::InvalidIdentifier));
}

#[test]
fn entity_events_follow_the_commit_order() {
    let seen: Arc<Mutex<Vec<String>>> = Arc::default();
    let f = fixture();
    for kind in EntityEventKind::ALL {
        let seen = Arc::clone(&seen);
        f.em.events().listen(kind, move |event| {
            seen.lock()
                .unwrap()
                .push(format!("{} {}", event.kind(), event.entity().handle()));
            Ok(())
        });
    }

    let desk = product("desk", 99.0);
    let handle = desk.handle();
    f.em.persist(&desk).unwrap();
    f.em.flush().unwrap();
    desk.write().price = 120.0;
    f.em.flush().unwrap();
    f.em.remove(&desk).unwrap();
    f.em.flush().unwrap();

    let expected: Vec<String> = [
        "entity.pre_persist",
        "entity.post_persist",
        "entity.pre_update",
        "entity.post_update",
        "entity.pre_remove",
        "entity.post_remove",
    ]
    .iter()
    .map(|kind| format!("{kind} {handle}"))
    .collect();
    assert_eq!(*seen.lock().unwrap(), expected);
}

#[test]
fn update_events_cover_clean_tracked_entities() {
    let seen: Arc<Mutex<Vec<EntityEventKind>>> = Arc::default();
    let f = fixture();
    f.products.seed(stored_product(1, "lamp", 12.5));
    for kind in [EntityEventKind::PreUpdate, EntityEventKind::PostUpdate] {
        let seen = Arc::clone(&seen);
        f.em.events().listen(kind, move |event| {
            seen.lock().unwrap().push(event.kind());
            Ok(())
        });
    }

    f.em.find::<Product>(1).unwrap().unwrap();
    f.em.flush().unwrap();
    assert_eq!(
        *seen.lock().unwrap(),
        vec![EntityEventKind::PreUpdate, EntityEventKind::PostUpdate]
    );
    assert_eq!(f.products.call_count("update"), 0);

    let desk = product("desk", 99.0);
    f.em.persist(&desk).unwrap();
    seen.lock().unwrap().clear();
    f.em.flush().unwrap();
    assert_eq!(seen.lock().unwrap().len(), 2);
}

#[test]
fn listener_error_aborts_the_commit() {
    let f = fixture();
    f.products.seed(stored_product(1, "lamp", 12.5));
    f.em.events().listen(EntityEventKind::PreUpdate, |_| {
        Err(Error::Custom("updates are frozen".into()))
    });

    let lamp = f.em.find::<Product>(1).unwrap().unwrap();
    lamp.write().active = true;
    let err = f.em.flush().unwrap_err();
    assert!(err.is_commit_failure());
    assert!(err.to_string().contains("updates are frozen"));
    assert_eq!(f.products.call_count("update"), 0);
    assert_eq!(f.connection.log(), vec!["begin", "rollback"]);
}

#[test]
fn stopped_propagation_skips_later_listeners() {
    let seen: Arc<Mutex<Vec<&'static str>>> = Arc::default();
    let f = fixture();
    let first = Arc::clone(&seen);
    f.em.events().listen(EntityEventKind::PrePersist, move |event| {
        first.lock().unwrap().push("first");
        event.stop_propagation();
        Ok(())
    });
    let second = Arc::clone(&seen);
    f.em.events().listen(EntityEventKind::PrePersist, move |_| {
        second.lock().unwrap().push("second");
        Ok(())
    });

    f.em.persist(&product("desk", 99.0)).unwrap();
    f.em.flush().unwrap();
    assert_eq!(*seen.lock().unwrap(), vec!["first"]);
    assert_eq!(f.products.call_count("insert"), 1);
}

#[test]
fn entity_events_can_be_disabled() {
    let fired = Arc::new(Mutex::new(false));
    let f = fixture_with(
        EntityManagerConfig::new().dispatch_entity_events(false),
        product_metadata(),
    );
    let flag = Arc::clone(&fired);
    f.em.events().listen(EntityEventKind::PrePersist, move |_| {
        *flag.lock().unwrap() = true;
        Ok(())
    });

    f.em.persist(&product("desk", 99.0)).unwrap();
    f.em.flush().unwrap();
    assert!(!*fired.lock().unwrap());
    assert_eq!(f.products.call_count("insert"), 1);
}

fn launch_date() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 9, 30, 0).unwrap()
}

#[test]
fn lifecycle_hooks_shape_written_rows() {
    let metadata = ClassMetadata::builder_for::<Product>()
        .id(FieldMapping::new("id", FieldType::Integer))
        .field(FieldMapping::new("active", FieldType::Boolean))
        .field(FieldMapping::new("created_at", FieldType::DateTime).nullable(true))
        .field(FieldMapping::new("name", FieldType::String))
        .field(FieldMapping::new("price", FieldType::Float).column("unit_price"))
        .field(FieldMapping::new("nickname", FieldType::String).nullable(true))
        .on::<Product, _>(LifecycleEvent::PrePersist, |p| {
            p.created_at = Some(launch_date());
            Ok(())
        })
        .on::<Product, _>(LifecycleEvent::PreUpdate, |p| {
            p.nickname = Some(p.name.to_uppercase());
            Ok(())
        })
        .on::<Product, _>(LifecycleEvent::PostLoad, |p| {
            p.loads += 1;
            Ok(())
        })
        .build()
        .unwrap();
    let f = fixture_with(EntityManagerConfig::default(), metadata);

    let desk = product("desk", 99.0);
    f.em.persist(&desk).unwrap();
    assert_eq!(desk.read().created_at, Some(launch_date()));
    f.em.flush().unwrap();
    assert_eq!(
        f.products.rows()[0].get("created_at"),
        Some(&Value::DateTime(launch_date()))
    );

    f.products.seed(stored_product(7, "lamp", 12.5));
    let lamp = f.em.find::<Product>(7).unwrap().unwrap();
    assert_eq!(lamp.read().loads, 1);
    f.em.find::<Product>(7).unwrap().unwrap();
    assert_eq!(lamp.read().loads, 1);

    lamp.write().price = 14.0;
    f.em.flush().unwrap();
    let stored = f
        .products
        .rows()
        .into_iter()
        .find(|row| row.get("id") == Some(&Value::Int(7)))
        .unwrap();
    assert_eq!(stored.get("nickname"), Some(&Value::from("LAMP")));
}

#[test]
fn refresh_restores_stored_values() {
    let f = fixture();
    f.products.seed(stored_product(1, "lamp", 12.5));
    let lamp = f.em.find::<Product>(1).unwrap().unwrap();

    lamp.write().name = "scribbled".into();
    f.products
        .update(
            &Identifier::from([("id", 1_i64)]),
            &Row::new().with("unit_price", 13.0),
        )
        .unwrap();
    f.em.refresh(&lamp).unwrap();
    assert_eq!(lamp.read().name, "lamp");
    assert_eq!(lamp.read().price, 13.0);
    assert_eq!(lamp.read().id, Some(1));

    f.products.delete(&Identifier::from([("id", 1_i64)])).unwrap();
    let err = f.em.refresh(&lamp).unwrap_err();
    assert_eq!(err.state_kind(), Some(StateErrorKind::RefreshFailed));
    assert!(err.to_string().contains("Unable to refresh entity"));
}

#[test]
fn updating_an_unknown_entity_is_a_state_error() {
    let f = fixture();
    let stray = product("stray", 1.0);
    let err = f.em.persister::<Product>().unwrap().update(&stray).unwrap_err();
    assert_eq!(err.state_kind(), Some(StateErrorKind::NotTracked));
    assert!(err.to_string().contains("Unable to update entity"));
}

#[test]
fn value_objects_survive_a_round_trip() {
    init_tracing();

    #[derive(Debug, Default)]
    struct Invoice {
        id: Option<i64>,
        total: Option<Money>,
        contact: Option<Email>,
    }

    aem_core::entity!(Invoice, "Invoice" { id, total, contact });

    let adapter = Arc::new(MemoryAdapter::new("invoices", ["id"]));
    let metadata = ClassMetadata::builder_for::<Invoice>()
        .id(FieldMapping::new("id", FieldType::Integer))
        .field(FieldMapping::new("total", FieldType::ValueObject("Money")))
        .field(FieldMapping::new("contact", FieldType::ValueObject("Email")))
        .build()
        .unwrap();
    let em = EntityManager::builder()
        .entity::<Invoice>(metadata, adapter.clone())
        .build()
        .unwrap();

    let invoice = EntityRef::new(Invoice {
        id: None,
        total: Some(Money::new(250.0, "EUR").unwrap()),
        contact: Some(Email::new("billing@example.com").unwrap()),
    });
    em.persist(&invoice).unwrap();
    em.flush().unwrap();
    let stored = &adapter.rows()[0];
    assert!(matches!(stored.get("total"), Some(Value::Json(_))));
    assert_eq!(stored.get("contact"), Some(&Value::from("billing@example.com")));

    em.clear();
    let reloaded = em.find::<Invoice>(1).unwrap().unwrap();
    assert!(!reloaded.ptr_eq(&invoice));
    let reloaded = reloaded.read();
    assert_eq!(reloaded.total, Some(Money::new(250.0, "EUR").unwrap()));
    assert_eq!(reloaded.contact.as_ref().map(Email::as_str), Some("billing@example.com"));
}

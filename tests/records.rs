mod common;

use common::*;
use schemaforge::query::{FilterNode, ListRequest};
use schemaforge::service::access::FieldAccess;
use schemaforge::service::{DomainEvent, MemoryAuditSink, RecordEventType, StaticAccessControl};
use schemaforge::{AppError, AppState, MemoryMetadataStore, MemoryRecordStore, RequestContext, Settings};
use serde_json::{json, Value};
use std::sync::Arc;
use uuid::Uuid;

fn id_of(v: &Value) -> Uuid {
    v["id"].as_str().unwrap().parse().unwrap()
}

#[tokio::test]
async fn create_then_get_round_trips() {
    let state = state();
    published_customer(&state, TENANT).await;
    let c = ctx(TENANT);
    let created = state
        .crud
        .create(&c, "customer", json!({"name": "Ada", "email": "Ada@Example.com"}))
        .await
        .unwrap();
    let read = state.crud.get(&c, "customer", id_of(&created), &[]).await.unwrap();
    for key in ["id", "name", "email", "created_at", "created_by", "updated_at"] {
        assert_eq!(read[key], created[key], "{key}");
    }
    assert_eq!(read["name"], "Ada");
}

#[tokio::test]
async fn duplicate_email_is_a_field_error() {
    let state = state();
    published_customer(&state, TENANT).await;
    let c = ctx(TENANT);
    state
        .crud
        .create(&c, "customer", json!({"name": "Ada", "email": "ada@example.com"}))
        .await
        .unwrap();
    let err = state
        .crud
        .create(&c, "customer", json!({"name": "Other Ada", "email": "ada@example.com"}))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Validation { field: Some(ref f), .. } if f == "email"), "{err:?}");
}

#[tokio::test]
async fn input_is_checked_against_the_model() {
    let state = state();
    published_customer(&state, TENANT).await;
    let c = ctx(TENANT);
    let missing = state.crud.create(&c, "customer", json!({"email": "x@example.com"})).await.unwrap_err();
    assert!(matches!(missing, AppError::Validation { field: Some(ref f), .. } if f == "name"));
    let unknown = state.crud.create(&c, "customer", json!({"name": "A", "shoe_size": 42})).await.unwrap_err();
    assert!(matches!(unknown, AppError::Validation { field: Some(ref f), .. } if f == "shoe_size"));
    let system = state.crud.create(&c, "customer", json!({"name": "A", "created_by": "mallory"})).await.unwrap_err();
    assert!(matches!(system, AppError::Validation { field: Some(ref f), .. } if f == "created_by"));
    let bad_email = state.crud.create(&c, "customer", json!({"name": "A", "email": "nope"})).await.unwrap_err();
    assert!(matches!(bad_email, AppError::Validation { field: Some(ref f), .. } if f == "email"));
}

#[tokio::test]
async fn update_and_delete() {
    let state = state();
    published_customer(&state, TENANT).await;
    let c = ctx(TENANT);
    let created = state.crud.create(&c, "customer", json!({"name": "Ada"})).await.unwrap();
    let id = id_of(&created);

    let updated = state.crud.update(&c, "customer", id, json!({"name": "Ada L."})).await.unwrap();
    assert_eq!(updated["name"], "Ada L.");
    assert_eq!(updated["created_at"], created["created_at"]);

    let removed = state.crud.delete(&c, "customer", id).await.unwrap();
    assert_eq!(removed["name"], "Ada L.");
    let err = state.crud.get(&c, "customer", id, &[]).await.unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)));
    let err = state.crud.delete(&c, "customer", id).await.unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)));
}

#[tokio::test]
async fn tenants_are_isolated() {
    let state = state();
    published_customer(&state, "acme").await;
    published_customer(&state, "globex").await;
    let acme = ctx("acme");
    let globex = ctx("globex");
    let created = state.crud.create(&acme, "customer", json!({"name": "Ada"})).await.unwrap();

    let page = state.crud.list(&globex, "customer", &ListRequest::default()).await.unwrap();
    assert_eq!(page.total, 0);
    let err = state.crud.get(&globex, "customer", id_of(&created), &[]).await.unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)));
    let err = state.crud.delete(&globex, "customer", id_of(&created)).await.unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)));

    // a tenant without the entity does not see it at all
    let err = state.crud.list(&ctx("initech"), "customer", &ListRequest::default()).await.unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)));
}

#[tokio::test]
async fn list_filters_sorts_and_pages() {
    let state = state();
    published_customer(&state, TENANT).await;
    let c = ctx(TENANT);
    for name in ["Carol", "Ada", "Bob", "Alan"] {
        state.crud.create(&c, "customer", json!({ "name": name })).await.unwrap();
    }
    let req = ListRequest {
        filter: Some(FilterNode::parse(&json!({"field": "name", "op": "starts_with", "value": "a"})).unwrap()),
        sort: schemaforge::query::parse_sort("name"),
        limit: Some(1),
        ..Default::default()
    };
    let page = state.crud.list(&c, "customer", &req).await.unwrap();
    assert_eq!(page.total, 2);
    assert_eq!(page.limit, 1);
    assert_eq!(page.data.len(), 1);
    assert_eq!(page.data[0]["name"], "Ada");

    let req = ListRequest {
        sort: schemaforge::query::parse_sort("-name"),
        offset: Some(1),
        ..Default::default()
    };
    let page = state.crud.list(&c, "customer", &req).await.unwrap();
    let names: Vec<&str> = page.data.iter().map(|r| r["name"].as_str().unwrap()).collect();
    assert_eq!(names, ["Bob", "Alan", "Ada"]);
}

#[tokio::test]
async fn filters_on_unknown_fields_are_rejected() {
    let state = state();
    published_customer(&state, TENANT).await;
    let req = ListRequest {
        filter: Some(FilterNode::parse(&json!({"field": "password", "op": "eq", "value": "x"})).unwrap()),
        ..Default::default()
    };
    let err = state.crud.list(&ctx(TENANT), "customer", &req).await.unwrap_err();
    assert!(matches!(err, AppError::Validation { .. }));
}

#[tokio::test]
async fn bulk_create_reports_per_item() {
    let state = state();
    published_customer(&state, TENANT).await;
    let c = ctx(TENANT);
    let items = vec![json!({"name": "Ada"}), json!({"email": "no-name@example.com"}), json!({"name": "Bob"})];

    let result = state.crud.bulk_create(&c, "customer", items.clone(), false).await.unwrap();
    assert_eq!(result.succeeded, 2);
    assert_eq!(result.failed, 1);
    assert!(!result.results[1].ok);
    let detail = result.results[1].error.as_ref().unwrap();
    assert_eq!(detail.code, "validation_error");
    assert_eq!(detail.field.as_deref(), Some("name"));

    let err = state.crud.bulk_create(&c, "customer", items, true).await.unwrap_err();
    assert!(matches!(err, AppError::Validation { field: Some(ref f), .. } if f == "items[1].name"));
    let page = state.crud.list(&c, "customer", &ListRequest::default()).await.unwrap();
    assert_eq!(page.total, 2);
}

#[tokio::test]
async fn bulk_limit_is_enforced() {
    let state = AppState::in_memory(Settings {
        bulk_limit: 2,
        ..Settings::default()
    });
    published_customer(&state, TENANT).await;
    let items = vec![json!({"name": "A"}), json!({"name": "B"}), json!({"name": "C"})];
    let err = state.crud.bulk_create(&ctx(TENANT), "customer", items, false).await.unwrap_err();
    assert!(matches!(err, AppError::Validation { field: Some(ref f), .. } if f == "items"));
}

#[tokio::test]
async fn roles_limit_actions_and_fields() {
    let state = state();
    published_customer(&state, TENANT).await;
    let admin = ctx(TENANT);
    let created = state
        .crud
        .create(&admin, "customer", json!({"name": "Ada", "email": "ada@example.com"}))
        .await
        .unwrap();

    let policy = StaticAccessControl::default()
        .grant("admin", "*")
        .grant("clerk", "customer.read")
        .grant("clerk", "customer.update")
        .restrict("clerk", "customer", "email", FieldAccess::Hidden)
        .restrict("clerk", "customer", "name", FieldAccess::Read);
    let state = state.with_access(Arc::new(policy));
    let clerk = RequestContext::new(TENANT, "carl", "clerk");

    let read = state.crud.get(&clerk, "customer", id_of(&created), &[]).await.unwrap();
    assert!(read.get("email").is_none());
    assert_eq!(read["name"], "Ada");

    let err = state.crud.create(&clerk, "customer", json!({"name": "Bob"})).await.unwrap_err();
    assert!(matches!(err, AppError::Permission(_)));
    let err = state
        .crud
        .update(&clerk, "customer", id_of(&created), json!({"name": "Eve"}))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Permission(_)));

    let req = ListRequest {
        filter: Some(FilterNode::parse(&json!({"field": "email", "op": "eq", "value": "ada@example.com"})).unwrap()),
        ..Default::default()
    };
    let err = state.crud.list(&clerk, "customer", &req).await.unwrap_err();
    assert!(matches!(err, AppError::Permission(_)));
}

#[tokio::test]
async fn writes_are_audited_and_announced() {
    let sink = Arc::new(MemoryAuditSink::default());
    let state = AppState::new(
        Settings::default(),
        Arc::new(MemoryMetadataStore::new()),
        Arc::new(MemoryRecordStore::new()),
        Arc::new(schemaforge::service::AllowAll),
        sink.clone(),
    );
    published_customer(&state, TENANT).await;
    let mut events = state.events.subscribe();
    let c = ctx(TENANT);

    let created = state.crud.create(&c, "customer", json!({"name": "Ada"})).await.unwrap();
    state.crud.update(&c, "customer", id_of(&created), json!({"name": "Ada L."})).await.unwrap();
    state.audit.flush().await.unwrap();

    let records = sink.records();
    let actions: Vec<&str> = records.iter().map(|r| r.action.as_str()).collect();
    assert_eq!(actions, ["publish", "create", "update"]);

    let DomainEvent::Record(first) = events.try_recv().unwrap() else { panic!("expected record event") };
    assert_eq!(first.event_type, RecordEventType::OnCreate);
    let DomainEvent::Record(second) = events.try_recv().unwrap() else { panic!("expected record event") };
    assert_eq!(second.event_type, RecordEventType::OnUpdate);
    let diff = second.diff.unwrap();
    assert_eq!(diff["name"]["before"], "Ada");
    assert_eq!(diff["name"]["after"], "Ada L.");
}

#[tokio::test]
async fn soft_deleted_records_disappear_and_free_unique_values() {
    let state = state();
    let member = state
        .registry
        .create_entity(TENANT, payload(json!({"name": "member", "soft_delete": true})))
        .await
        .unwrap();
    field(
        &state,
        TENANT,
        &member,
        json!({"name": "email", "field_type": {"type": "email"}, "constraints": {"unique": true}}),
    )
    .await;
    state.migrations.publish(TENANT, member.id, "alice").await.unwrap();
    let c = ctx(TENANT);

    let first = state.crud.create(&c, "member", json!({"email": "kim@example.com"})).await.unwrap();
    let removed = state.crud.delete(&c, "member", id_of(&first)).await.unwrap();
    assert_eq!(removed["email"], "kim@example.com");

    let err = state.crud.get(&c, "member", id_of(&first), &[]).await.unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)));
    let err = state.crud.delete(&c, "member", id_of(&first)).await.unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)));
    assert_eq!(state.crud.list(&c, "member", &ListRequest::default()).await.unwrap().total, 0);

    let second = state.crud.create(&c, "member", json!({"email": "kim@example.com"})).await.unwrap();
    assert_ne!(id_of(&second), id_of(&first));
    assert_eq!(state.crud.list(&c, "member", &ListRequest::default()).await.unwrap().total, 1);
}

#[tokio::test]
async fn all_or_nothing_bulk_writes_nothing_on_error() {
    let state = state();
    published_customer(&state, TENANT).await;
    let c = ctx(TENANT);

    let items = vec![
        json!({"name": "Ada", "email": "same@example.com"}),
        json!({"name": "Bob", "email": "same@example.com"}),
    ];
    let err = state.crud.bulk_create(&c, "customer", items, true).await.unwrap_err();
    assert!(matches!(err, AppError::Validation { field: Some(ref f), .. } if f.ends_with("email")), "{err:?}");
    assert_eq!(state.crud.list(&c, "customer", &ListRequest::default()).await.unwrap().total, 0);

    let kept = state.crud.create(&c, "customer", json!({"name": "Cy"})).await.unwrap();
    let err = state
        .crud
        .bulk_delete(&c, "customer", vec![id_of(&kept), Uuid::new_v4()], true)
        .await;
    assert!(err.is_err());
    state.crud.get(&c, "customer", id_of(&kept), &[]).await.unwrap();

    let err = state
        .crud
        .bulk_update(
            &c,
            "customer",
            vec![
                json!({"id": kept["id"], "name": "Cyrus"}),
                json!({"id": kept["id"], "email": "not-an-email"}),
            ],
            true,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Validation { field: Some(ref f), .. } if f == "items[1].email"));
    let read = state.crud.get(&c, "customer", id_of(&kept), &[]).await.unwrap();
    assert_eq!(read["name"], "Cy");
}

#[tokio::test]
async fn archived_entities_refuse_records() {
    let state = state();
    let e = published_customer(&state, TENANT).await;
    let c = ctx(TENANT);
    let ada = state.crud.create(&c, "customer", json!({"name": "Ada"})).await.unwrap();

    state.migrations.archive(TENANT, e.id, "alice").await.unwrap();
    let err = state.crud.create(&c, "customer", json!({"name": "Bob"})).await.unwrap_err();
    assert!(matches!(err, AppError::Conflict(_)));
    let err = state.crud.get(&c, "customer", id_of(&ada), &[]).await.unwrap_err();
    assert!(matches!(err, AppError::Conflict(_)));
    let err = state
        .crud
        .update(&c, "customer", id_of(&ada), json!({"name": "Ada L."}))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Conflict(_)));
    let err = state.crud.delete(&c, "customer", id_of(&ada)).await.unwrap_err();
    assert!(matches!(err, AppError::Conflict(_)));
}

#[tokio::test]
async fn declared_rules_run_on_create_and_update() {
    let state = state();
    let sku = entity(&state, TENANT, "sku").await;
    field(
        &state,
        TENANT,
        &sku,
        json!({
            "name": "code",
            "field_type": {"type": "string"},
            "validation_rules": [{"rule": "regex", "pattern": "^[A-Z]{3}$", "message": "three capitals"}]
        }),
    )
    .await;
    field(&state, TENANT, &sku, json!({"name": "min_qty", "field_type": {"type": "integer"}})).await;
    field(
        &state,
        TENANT,
        &sku,
        json!({
            "name": "max_qty",
            "field_type": {"type": "integer"},
            "validation_rules": [{"rule": "expression", "expression": "max_qty >= min_qty", "message": "below minimum"}]
        }),
    )
    .await;
    state.migrations.publish(TENANT, sku.id, "alice").await.unwrap();
    let c = ctx(TENANT);

    let err = state.crud.create(&c, "sku", json!({"code": "abc"})).await.unwrap_err();
    match err {
        AppError::Validation { field, message } => {
            assert_eq!(field.as_deref(), Some("code"));
            assert_eq!(message, "three capitals");
        }
        other => panic!("expected validation error, got {other:?}"),
    }
    let err = state
        .crud
        .create(&c, "sku", json!({"code": "ABC", "min_qty": 5, "max_qty": 2}))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Validation { field: Some(ref f), .. } if f == "max_qty"));

    let item = state
        .crud
        .create(&c, "sku", json!({"code": "ABC", "min_qty": 1, "max_qty": 5}))
        .await
        .unwrap();
    // raising the minimum re-checks the rule declared on max_qty
    let err = state
        .crud
        .update(&c, "sku", id_of(&item), json!({"min_qty": 9}))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Validation { field: Some(ref f), .. } if f == "max_qty"));
    let err = state
        .crud
        .update(&c, "sku", id_of(&item), json!({"code": "AB1"}))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Validation { field: Some(ref f), .. } if f == "code"));

    let updated = state
        .crud
        .update(&c, "sku", id_of(&item), json!({"min_qty": 9, "max_qty": 10}))
        .await
        .unwrap();
    assert_eq!(updated["min_qty"], 9);
    assert_eq!(updated["max_qty"], 10);
}

use persona_store::{InMemoryStore, PersonaStore};
use persona_types::{
    Event, EventId, EventStatus, EventSubscription, ExecutionRecord, ExecutionStatus, Persona,
    PersonaId, ProjectId, SubscriptionId, Trigger, TriggerId, TriggerType,
};
use std::sync::Arc;

fn persona(id: &str) -> Persona {
    Persona {
        id: PersonaId::new(id),
        project_id: ProjectId::default_project(),
        name: id.to_string(),
        system_prompt: "be helpful".to_string(),
        structured_prompt: None,
        enabled: true,
        max_concurrent: 1,
        timeout_ms: 300_000,
        model_profile: None,
        budget_usd: None,
        max_cost_per_execution_usd: None,
        bound_credentials: vec![],
        bound_tools: vec![],
    }
}

fn pending_event(event_type: &str, created_at_ms: u64) -> Event {
    Event {
        id: EventId::new(""),
        project_id: ProjectId::default_project(),
        event_type: event_type.to_string(),
        source_type: "test".to_string(),
        source_id: None,
        target_persona_id: None,
        payload: None,
        status: EventStatus::Pending,
        use_case_id: None,
        created_at_ms,
        processed_at_ms: None,
        error_message: None,
    }
}

#[tokio::test]
async fn load_persona_roundtrips() {
    let store = InMemoryStore::new();
    store.put_persona(persona("builder")).await;

    let loaded = store.load_persona(&PersonaId::new("builder")).await.unwrap();
    assert!(loaded.is_some());
    assert_eq!(loaded.unwrap().name, "builder");
}

#[tokio::test]
async fn load_missing_persona_returns_none() {
    let store = InMemoryStore::new();
    let loaded = store.load_persona(&PersonaId::new("nope")).await.unwrap();
    assert!(loaded.is_none());
}

#[tokio::test]
async fn count_running_executions_only_counts_running() {
    let store = InMemoryStore::new();
    let persona_id = PersonaId::new("builder");

    let mut running = ExecutionRecord::queued(
        persona_types::ExecutionId::new("e-1"),
        ProjectId::default_project(),
        persona_id.clone(),
    );
    running.status = ExecutionStatus::Running;
    store.insert_execution(running).await.unwrap();

    let queued = ExecutionRecord::queued(
        persona_types::ExecutionId::new("e-2"),
        ProjectId::default_project(),
        persona_id.clone(),
    );
    store.insert_execution(queued).await.unwrap();

    assert_eq!(store.count_running_executions(&persona_id).await.unwrap(), 1);
}

#[tokio::test]
async fn pending_events_ordered_by_created_at() {
    let store = InMemoryStore::new();
    store.insert_event(pending_event("a", 200)).await.unwrap();
    store.insert_event(pending_event("b", 100)).await.unwrap();

    let events = store.read_pending_events(10).await.unwrap();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].event_type, "b");
    assert_eq!(events[1].event_type, "a");
}

#[tokio::test]
async fn read_pending_events_respects_limit() {
    let store = InMemoryStore::new();
    for i in 0..5 {
        store.insert_event(pending_event("t", i)).await.unwrap();
    }
    let events = store.read_pending_events(2).await.unwrap();
    assert_eq!(events.len(), 2);
}

#[tokio::test]
async fn claim_event_transitions_pending_to_processing_once() {
    let store = InMemoryStore::new();
    let id = store.insert_event(pending_event("a", 1)).await.unwrap();

    assert!(store.try_claim_event(&id).await.unwrap());
    assert!(!store.try_claim_event(&id).await.unwrap());
}

#[tokio::test]
async fn claim_event_guards_against_concurrent_claims() {
    let store = Arc::new(InMemoryStore::new());
    let id = store.insert_event(pending_event("a", 1)).await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let store = Arc::clone(&store);
        let id = id.clone();
        handles.push(tokio::spawn(async move { store.try_claim_event(&id).await.unwrap() }));
    }

    let mut successes = 0;
    for h in handles {
        if h.await.unwrap() {
            successes += 1;
        }
    }
    assert_eq!(successes, 1);
}

#[tokio::test]
async fn set_event_status_updates_terminal_fields() {
    let store = InMemoryStore::new();
    let id = store.insert_event(pending_event("a", 1)).await.unwrap();

    store
        .set_event_status(&id, EventStatus::Delivered, Some(500), None)
        .await
        .unwrap();

    let events = store.read_pending_events(10).await.unwrap();
    assert!(events.is_empty());
}

#[tokio::test]
async fn list_subscriptions_filters_by_event_type() {
    let store = InMemoryStore::new();
    store
        .put_subscription(EventSubscription {
            id: SubscriptionId::new("s1"),
            project_id: ProjectId::default_project(),
            persona_id: PersonaId::new("builder"),
            event_type: "deploy.done".to_string(),
            source_filter: None,
            enabled: true,
        })
        .await;
    store
        .put_subscription(EventSubscription {
            id: SubscriptionId::new("s2"),
            project_id: ProjectId::default_project(),
            persona_id: PersonaId::new("reviewer"),
            event_type: "other".to_string(),
            source_filter: None,
            enabled: true,
        })
        .await;

    let subs = store
        .list_subscriptions(&ProjectId::default_project(), "deploy.done")
        .await
        .unwrap();
    assert_eq!(subs.len(), 1);
    assert_eq!(subs[0].id.as_str(), "s1");
}

#[tokio::test]
async fn due_triggers_respects_enabled_and_timing() {
    let store = InMemoryStore::new();
    store
        .put_trigger(Trigger {
            id: TriggerId::new("t1"),
            project_id: ProjectId::default_project(),
            persona_id: PersonaId::new("builder"),
            trigger_type: TriggerType::Schedule,
            config: "{}".to_string(),
            enabled: true,
            last_triggered_at_ms: None,
            next_trigger_at_ms: Some(100),
        })
        .await;
    store
        .put_trigger(Trigger {
            id: TriggerId::new("t2"),
            project_id: ProjectId::default_project(),
            persona_id: PersonaId::new("builder"),
            trigger_type: TriggerType::Schedule,
            config: "{}".to_string(),
            enabled: false,
            last_triggered_at_ms: None,
            next_trigger_at_ms: Some(50),
        })
        .await;

    let due = store.due_triggers(200).await.unwrap();
    assert_eq!(due.len(), 1);
    assert_eq!(due[0].id.as_str(), "t1");

    let not_yet = store.due_triggers(50).await.unwrap();
    assert!(not_yet.is_empty());
}

#[tokio::test]
async fn update_trigger_timings_persists() {
    let store = InMemoryStore::new();
    store
        .put_trigger(Trigger {
            id: TriggerId::new("t1"),
            project_id: ProjectId::default_project(),
            persona_id: PersonaId::new("builder"),
            trigger_type: TriggerType::Schedule,
            config: "{}".to_string(),
            enabled: true,
            last_triggered_at_ms: None,
            next_trigger_at_ms: Some(100),
        })
        .await;

    store
        .update_trigger_timings(&TriggerId::new("t1"), 100, 200)
        .await
        .unwrap();

    let due = store.due_triggers(150).await.unwrap();
    assert!(due.is_empty());
    let due = store.due_triggers(200).await.unwrap();
    assert_eq!(due.len(), 1);
}

#[tokio::test]
async fn usable_as_dyn_persona_store() {
    let store: Arc<dyn PersonaStore> = Arc::new(InMemoryStore::new());
    store.insert_event(pending_event("a", 1)).await.unwrap();
    let events = store.read_pending_events(10).await.unwrap();
    assert_eq!(events.len(), 1);
}

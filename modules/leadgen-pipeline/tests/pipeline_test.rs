//! End-to-end: a queued work item through fetch, ingestion, ICP detection,
//! enrichment and publishing, all against the in-memory store.
//!
//! Run with: cargo test -p leadgen-pipeline --test pipeline_test

use std::sync::Arc;
use std::time::Duration;

use leadgen_common::{
    IcpCategory, LeadGrade, LeadStatus, MessageResult, NewRawRecord, PipelineError, RawStatus,
    SourceType, WorkStatus,
};
use leadgen_pipeline::clock::Clock;
use leadgen_pipeline::publisher::PublishOutcome;
use leadgen_pipeline::store::{LeadStore, MemoryStore, RawRecordStore};
use leadgen_pipeline::testing::{
    joes_plumbing, memory_deps, ready_lead, registry_partial, work_item, ManualClock,
    MockEnrichment, MockFetcher,
};
use leadgen_pipeline::traits::EnrichmentProvider;
use leadgen_pipeline::{DispatchStatus, PipelineDeps};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn joes_in_dallas() -> NewRawRecord {
    let mut record = joes_plumbing();
    record.source_id = "def456".into();
    record.city = Some("Dallas".into());
    record.zip_code = Some("75201".into());
    record
}

fn deps_with(
    store: Arc<MemoryStore>,
    fetcher: MockFetcher,
    providers: Vec<Arc<dyn EnrichmentProvider>>,
) -> PipelineDeps {
    memory_deps(
        store,
        vec![],
        Arc::new(fetcher),
        providers,
        Arc::new(ManualClock::at_noon()),
    )
}

fn registry() -> Vec<Arc<dyn EnrichmentProvider>> {
    vec![Arc::new(MockEnrichment::returning("registry", registry_partial()))]
}

// =========================================================================
// Tests
// =========================================================================

#[tokio::test]
async fn hard_to_find_plumber_is_published_end_to_end() {
    let store = Arc::new(MemoryStore::new());
    let fetcher = MockFetcher::new().on_fetch(
        SourceType::GoogleMaps,
        "78701",
        "plumber",
        vec![joes_plumbing()],
    );
    let deps = deps_with(store.clone(), fetcher, registry());
    let queue = Arc::new(deps.queue());
    let worker = deps.worker(queue.clone(), Arc::new(deps.rate_limiter()));

    let item = queue.enqueue(work_item("78701", 10)).await.unwrap().item().clone();
    let report = worker.run_once(SourceType::GoogleMaps).await.unwrap();

    assert_eq!(report.status, DispatchStatus::Completed);
    assert_eq!(report.work_item_id, Some(item.id));
    assert_eq!(report.attempt, Some(1));
    assert_eq!(report.records_found, 1);
    assert_eq!(report.ingested, 1);
    assert_eq!(report.leads, 1);
    assert_eq!(report.published, 1);
    assert_eq!(report.record_errors, 0);

    let raw = store
        .find_raw(SourceType::GoogleMaps, "abc123")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(raw.status, RawStatus::Enriched);

    let signal = store.latest_signal(raw.id).await.unwrap().unwrap();
    assert!(signal.assessment.no_website);
    assert!(signal.assessment.unmappable_address);
    assert_eq!(signal.assessment.icp_score, 74);
    assert_eq!(signal.assessment.icp_category, IcpCategory::High);

    let lead = store.lead_for_raw(raw.id).await.unwrap().unwrap();
    assert_eq!(lead.status, LeadStatus::Ready);
    assert_eq!(lead.lead_score, 76);
    assert_eq!(lead.lead_grade, LeadGrade::B);
    assert_eq!(lead.enrichment_confidence, 1.0);
    assert_eq!(lead.enrichment_sources, vec!["registry".to_string()]);
    assert_eq!(lead.phone.as_deref(), Some("5125550100"));

    let profile = deps
        .publisher()
        .profile_by_slug("joes-plumbing")
        .await
        .unwrap()
        .expect("profile should be published");
    assert_eq!(profile.enriched_lead_id, lead.id);
    assert!(!profile.is_claimed);
    assert_eq!(profile.schema_org.kind, "LocalBusiness");
    assert!(profile.seo.canonical_path.ends_with("joes-plumbing"));

    let item = queue.get(item.id).await.unwrap();
    assert_eq!(item.status, WorkStatus::Completed);
    assert_eq!(item.records_found, 1);
    let messages = queue.messages(item.id).await.unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].result, MessageResult::Succeeded);
    assert_eq!(messages[0].records_found, 1);

    let next = worker.run_once(SourceType::GoogleMaps).await.unwrap();
    assert_eq!(next.status, DispatchStatus::Idle);
}

#[tokio::test]
async fn same_name_in_two_cities_gets_city_qualified_slug() {
    let store = Arc::new(MemoryStore::new());
    let fetcher = MockFetcher::new()
        .on_fetch(SourceType::GoogleMaps, "78701", "plumber", vec![joes_plumbing()])
        .on_fetch(SourceType::GoogleMaps, "75201", "plumber", vec![joes_in_dallas()]);
    let deps = deps_with(store.clone(), fetcher, registry());
    let queue = Arc::new(deps.queue());
    let worker = deps.worker(queue.clone(), Arc::new(deps.rate_limiter()));

    queue.enqueue(work_item("78701", 2)).await.unwrap();
    queue.enqueue(work_item("75201", 1)).await.unwrap();
    assert_eq!(worker.run_once(SourceType::GoogleMaps).await.unwrap().published, 1);
    assert_eq!(worker.run_once(SourceType::GoogleMaps).await.unwrap().published, 1);

    let publisher = deps.publisher();
    let austin = publisher.profile_by_slug("joes-plumbing").await.unwrap().unwrap();
    let dallas = publisher
        .profile_by_slug("joes-plumbing-dallas")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(austin.city.as_deref(), Some("Austin"));
    assert_eq!(dallas.city.as_deref(), Some("Dallas"));
    assert_eq!(store.profile_count().unwrap(), 2);
}

#[tokio::test]
async fn many_namesakes_in_one_city_all_get_slugs() {
    let store = Arc::new(MemoryStore::new());
    let deps = deps_with(store.clone(), MockFetcher::new(), vec![]);
    let publisher = deps.publisher();

    let mut slugs = Vec::new();
    for _ in 0..52 {
        let (lead, _) = store
            .insert_lead_if_absent(ready_lead("Handyman Services", "Houston"))
            .await
            .unwrap();
        match publisher.publish(lead.id).await.unwrap() {
            PublishOutcome::Published(profile) => slugs.push(profile.slug),
            other => panic!("expected a new profile, got {other:?}"),
        }
    }

    assert_eq!(slugs[0], "handyman-services");
    assert_eq!(slugs[1], "handyman-services-houston");
    assert_eq!(slugs[2], "handyman-services-houston-2");
    assert_eq!(slugs[51], "handyman-services-houston-51");
    let mut distinct = slugs.clone();
    distinct.sort();
    distinct.dedup();
    assert_eq!(distinct.len(), 52);
    assert_eq!(store.profile_count().unwrap(), 52);
}

#[tokio::test]
async fn rescrape_updates_in_place_and_adds_a_signal() {
    let store = Arc::new(MemoryStore::new());
    let clock = Arc::new(ManualClock::at_noon());
    let deps = memory_deps(
        store.clone(),
        vec![],
        Arc::new(MockFetcher::new()),
        vec![],
        clock.clone(),
    );
    let ingestion = deps.ingestion();
    let detector = deps.detector();

    let first = ingestion.ingest(joes_plumbing()).await.unwrap();
    let first_signal = detector.score_record(&first).await.unwrap();

    clock.advance(chrono::Duration::days(7));
    let mut changed = joes_plumbing();
    changed.phone = Some("(512) 555-0142".into());
    let second = ingestion.ingest(changed).await.unwrap();
    let second_signal = detector.score_record(&second).await.unwrap();

    assert_eq!(second.id, first.id);
    assert_eq!(second.first_seen_at, first.first_seen_at);
    assert_eq!(second.last_updated_at, clock.now());
    assert_eq!(second.phone.as_deref(), Some("(512) 555-0142"));
    assert_eq!(store.raw_count().unwrap(), 1);

    assert_ne!(second_signal.id, first_signal.id);
    assert_ne!(
        second_signal.assessment.input_fingerprint,
        first_signal.assessment.input_fingerprint
    );
    assert_eq!(store.signal_count().unwrap(), 2);
    let latest = store.latest_signal(first.id).await.unwrap().unwrap();
    assert_eq!(latest.id, second_signal.id);
}

#[tokio::test]
async fn rescoring_unchanged_record_is_idempotent() {
    let store = Arc::new(MemoryStore::new());
    let deps = deps_with(store.clone(), MockFetcher::new(), vec![]);
    let raw = deps.ingestion().ingest(joes_plumbing()).await.unwrap();
    assert_eq!(raw.status, RawStatus::New);

    let detector = deps.detector();
    let first = detector.score_record(&raw).await.unwrap();
    let second = detector.score_by_id(raw.id).await.unwrap();

    assert_eq!(first.id, second.id);
    assert_eq!(
        serde_json::to_vec(&first.assessment).unwrap(),
        serde_json::to_vec(&second.assessment).unwrap()
    );
    assert_eq!(store.signal_count().unwrap(), 1);
    let raw = deps.ingestion().get(raw.id).await.unwrap();
    assert_eq!(raw.status, RawStatus::Processed);
}

#[tokio::test]
async fn concurrent_enrichment_yields_one_lead() {
    let store = Arc::new(MemoryStore::new());
    let provider = Arc::new(
        MockEnrichment::returning("registry", registry_partial())
            .with_delay(Duration::from_millis(20)),
    );
    let deps = deps_with(store.clone(), MockFetcher::new(), vec![provider.clone()]);

    let raw = deps.ingestion().ingest(joes_plumbing()).await.unwrap();
    let signal = deps.detector().score_record(&raw).await.unwrap();

    let enrichment = deps.enrichment();
    let (a, b) = tokio::join!(
        enrichment.enrich(&raw, &signal),
        enrichment.enrich(&raw, &signal)
    );
    let (a, b) = (a.unwrap(), b.unwrap());

    assert_eq!(a.id, b.id);
    assert_eq!(store.lead_count().unwrap(), 1);
    assert_eq!(provider.calls(), 2);
    let stored = store.lead_for_raw(raw.id).await.unwrap().unwrap();
    assert_eq!(stored.id, a.id);
}

#[tokio::test]
async fn failing_provider_lowers_confidence_but_not_the_batch() {
    let store = Arc::new(MemoryStore::new());
    let providers: Vec<Arc<dyn EnrichmentProvider>> = vec![
        Arc::new(MockEnrichment::returning("registry", registry_partial())),
        Arc::new(MockEnrichment::failing("reviews")),
    ];
    let deps = deps_with(store.clone(), MockFetcher::new(), providers);

    let raw = deps.ingestion().ingest(joes_plumbing()).await.unwrap();
    let signal = deps.detector().score_record(&raw).await.unwrap();
    let lead = deps.enrichment().enrich(&raw, &signal).await.unwrap();

    assert_eq!(lead.enrichment_confidence, 0.5);
    assert_eq!(lead.enrichment_sources, vec!["registry".to_string()]);
    assert_eq!(lead.status, LeadStatus::Enriched);
}

#[tokio::test]
async fn lead_without_contact_is_rejected_at_validation() {
    let store = Arc::new(MemoryStore::new());
    let deps = deps_with(store.clone(), MockFetcher::new(), vec![]);

    let raw = deps.ingestion().ingest(joes_plumbing()).await.unwrap();
    let signal = deps.detector().score_record(&raw).await.unwrap();
    let enrichment = deps.enrichment();
    let lead = enrichment.enrich(&raw, &signal).await.unwrap();
    assert_eq!(lead.status, LeadStatus::Enriched);

    let lead = enrichment.validate(lead.id).await.unwrap();
    assert_eq!(lead.status, LeadStatus::Rejected);
    assert!(lead.rejection_reason.is_some());
    let raw = deps.ingestion().get(raw.id).await.unwrap();
    assert_eq!(raw.status, RawStatus::Rejected);

    let publish = deps.publisher().publish(lead.id).await;
    assert!(matches!(publish, Err(PipelineError::NotPublishable(_))));
}

#[tokio::test]
async fn invalid_record_does_not_fail_the_item() {
    let store = Arc::new(MemoryStore::new());
    let mut nameless = joes_plumbing();
    nameless.source_id = "blank".into();
    nameless.business_name = "   ".into();
    let fetcher = MockFetcher::new().on_fetch(
        SourceType::GoogleMaps,
        "78701",
        "plumber",
        vec![nameless, joes_plumbing()],
    );
    let deps = deps_with(store.clone(), fetcher, registry());
    let queue = Arc::new(deps.queue());
    let worker = deps.worker(queue.clone(), Arc::new(deps.rate_limiter()));

    queue.enqueue(work_item("78701", 0)).await.unwrap();
    let report = worker.run_once(SourceType::GoogleMaps).await.unwrap();

    assert_eq!(report.status, DispatchStatus::Completed);
    assert_eq!(report.records_found, 2);
    assert_eq!(report.invalid_records, 1);
    assert_eq!(report.ingested, 1);
    assert_eq!(report.published, 1);
    assert_eq!(store.raw_count().unwrap(), 1);
}

#[tokio::test]
async fn profile_can_be_claimed_once() {
    let store = Arc::new(MemoryStore::new());
    let fetcher = MockFetcher::new().on_fetch(
        SourceType::GoogleMaps,
        "78701",
        "plumber",
        vec![joes_plumbing()],
    );
    let deps = deps_with(store, fetcher, registry());
    let queue = Arc::new(deps.queue());
    let worker = deps.worker(queue.clone(), Arc::new(deps.rate_limiter()));
    queue.enqueue(work_item("78701", 0)).await.unwrap();
    worker.run_once(SourceType::GoogleMaps).await.unwrap();

    let publisher = deps.publisher();
    let profile = publisher.profile_by_slug("joes-plumbing").await.unwrap().unwrap();

    let claimed = publisher.claim(profile.id, "joe@joesplumbing.test").await.unwrap();
    assert!(claimed.is_claimed);
    assert_eq!(claimed.claimed_by.as_deref(), Some("joe@joesplumbing.test"));
    assert_eq!(claimed.slug, profile.slug);

    let again = publisher.claim(profile.id, "someone-else").await;
    assert!(matches!(again, Err(PipelineError::AlreadyClaimed)));

    let republish = publisher.publish(profile.enriched_lead_id).await.unwrap();
    assert_eq!(republish.profile().id, profile.id);
}

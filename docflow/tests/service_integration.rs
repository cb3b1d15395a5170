//! Integration tests for the service facade.
//!
//! These exercise admission control, cancellation, metrics export, health
//! and alerting through [`DocflowService`].

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::*;
use docflow::config::{PipelineConfig, StageConfig};
use docflow::health::{AlertMetric, AlertRule, AlertState, HealthStatus};
use docflow::pipeline::{Document, DocumentId, PipelineStatus, RetryPolicy, StageStatus};
use docflow::resource::{AdmissionConfig, AdmissionState, ManualSampler, SystemLoad};
use docflow::service::{DocflowService, ServiceBuilder, ServiceError};

fn config() -> PipelineConfig {
    PipelineConfig::builder()
        .stage(StageConfig::new("parse", "parse"))
        .stage(StageConfig::new("index", "index").depends_on(["parse"]))
        .retry(RetryPolicy::immediate())
        .build()
}

fn load(cpu_percent: f64) -> SystemLoad {
    SystemLoad {
        cpu_percent,
        memory_used_bytes: 1 << 30,
        memory_total_bytes: 16 << 30,
    }
}

/// Service with a hand-driven sampler and background loops that only run
/// their first tick.
fn service(processors: &[Arc<TestProcessor>], sampler: &ManualSampler) -> DocflowService {
    ServiceBuilder::new(config())
        .with_registry(registry(processors))
        .with_sampler(sampler.clone())
        .with_admission(
            AdmissionConfig::default()
                .with_streaks(1, 1)
                .with_throttle_delay(Duration::from_millis(5)),
        )
        .with_sample_interval(Duration::from_secs(3600))
        .with_alert_interval(Duration::from_secs(3600))
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_process_reports_metrics_and_health() {
    let processors = vec![
        processor("parse", Behaviour::EchoInputs),
        processor("index", Behaviour::EchoInputs),
    ];
    let service = service(&processors, &ManualSampler::new());

    let result = service
        .process(Document::new("doc-1", "/data/doc-1.pdf"))
        .await
        .unwrap();
    assert_eq!(result.status, PipelineStatus::Success);
    assert!(service.active_documents().is_empty());

    service.flush_metrics().await;
    let text = service.get_metrics();
    assert!(text.contains("docflow_documents_total{status=\"success\"} 1"));
    assert!(text.contains("docflow_stage_results_total{stage=\"index\",status=\"success\"} 1"));
    assert!(text.contains("docflow_stage_attempts_total{stage=\"parse\"} 1"));
    assert!(text.contains("docflow_documents_in_flight 0"));
    assert!(text.contains("docflow_admission_rejected_total 0"));

    let snapshot = service.metrics_snapshot();
    assert_eq!(snapshot.error_rate(Duration::from_secs(60)), 0.0);

    let health = service.health_check();
    assert_eq!(health.status, HealthStatus::Healthy);
    assert!(service.readiness().ready);
    assert_eq!(service.progress(&DocumentId::new("doc-1")), Some(100.0));

    service.shutdown(true).await;
}

#[tokio::test]
async fn test_admission_closes_and_reopens_with_load() {
    let processors = vec![
        processor("parse", Behaviour::EchoInputs),
        processor("index", Behaviour::EchoInputs),
    ];
    let sampler = ManualSampler::new();
    sampler.set(load(99.0));
    let service = service(&processors, &sampler);

    service.refresh_resources();
    assert_eq!(service.admission_state(), AdmissionState::Closed);

    let rejected = service
        .process(Document::new("doc-hot", "/data/hot"))
        .await;
    match rejected {
        Err(ServiceError::AdmissionClosed { document_id }) => {
            assert_eq!(document_id, DocumentId::new("doc-hot"));
        }
        other => panic!("expected admission rejection, got {:?}", other.map(|r| r.status)),
    }
    assert_eq!(processors[0].calls(), 0);

    service.flush_metrics().await;
    assert!(service
        .get_metrics()
        .contains("docflow_admission_rejected_total 1"));
    assert!(!service.readiness().ready);
    assert_eq!(service.health_check().status, HealthStatus::Unhealthy);

    // One calm sample steps down to throttled, which still admits.
    sampler.set(load(10.0));
    let snapshot = service.refresh_resources();
    assert_eq!(snapshot.cpu_percent, 10.0);
    assert_eq!(service.admission_state(), AdmissionState::Throttled);
    assert_eq!(service.resource_snapshot(), Some(snapshot));

    let result = service
        .process(Document::new("doc-warm", "/data/warm"))
        .await
        .unwrap();
    assert!(result.is_success());

    service.refresh_resources();
    assert_eq!(service.admission_state(), AdmissionState::Open);
    assert!(service.readiness().ready);

    service.shutdown(true).await;
}

#[tokio::test]
async fn test_cancel_stops_running_document() {
    let stuck = processor("index", Behaviour::WaitForCancel);
    let processors = vec![processor("parse", Behaviour::EchoInputs), stuck.clone()];
    let service = service(&processors, &ManualSampler::new());
    let id = DocumentId::new("doc-cancel");

    assert!(!service.cancel(&DocumentId::new("unknown")));

    let (result, cancelled) = tokio::join!(
        service.process(Document::new("doc-cancel", "/data/c")),
        async {
            wait_until(|| stuck.calls() == 1).await;
            assert_eq!(service.active_documents(), vec![id.clone()]);
            service.cancel(&id)
        }
    );

    assert!(cancelled);
    let result = result.unwrap();
    assert_eq!(result.status, PipelineStatus::Cancelled);
    assert_eq!(result.stage_status("parse"), Some(StageStatus::Success));
    assert_eq!(result.stage_status("index"), Some(StageStatus::Cancelled));
    assert!(service.active_documents().is_empty());

    service.shutdown(true).await;
}

#[tokio::test]
async fn test_shutdown_refuses_new_documents() {
    let processors = vec![
        processor("parse", Behaviour::EchoInputs),
        processor("index", Behaviour::EchoInputs),
    ];
    let service = service(&processors, &ManualSampler::new());

    let report = service.shutdown(true).await;
    assert_eq!(report.cancelled, 0);

    let result = service.process(Document::new("doc-late", "/data/late")).await;
    assert!(matches!(result, Err(ServiceError::ShuttingDown)));
    assert!(!service.readiness().ready);
}

#[tokio::test]
async fn test_error_rate_alert_fires_after_failures() {
    let processors = vec![
        processor("parse", Behaviour::FailUnrecoverable),
        processor("index", Behaviour::EchoInputs),
    ];
    let service = service(&processors, &ManualSampler::new());

    let notified = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&notified);
    service.alerts().add_rule(AlertRule::new(
        "high-error-rate",
        AlertMetric::ErrorRate,
        0.5,
        Duration::from_secs(60),
    ));
    service.alerts().on_alert(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let result = service
        .process(Document::new("doc-bad", "/data/bad"))
        .await
        .unwrap();
    assert_eq!(result.status, PipelineStatus::TotalFailure);

    service.flush_metrics().await;
    let alerts = service.alerts().evaluate(&service.metrics_snapshot());

    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].rule, "high-error-rate");
    assert_eq!(alerts[0].state, AlertState::Firing);
    assert_eq!(alerts[0].value, 1.0);
    assert_eq!(notified.load(Ordering::SeqCst), 1);
    assert_eq!(service.alerts().firing(), vec!["high-error-rate".to_string()]);

    // The pipeline component reports the failure rate.
    assert_eq!(service.health_check().status, HealthStatus::Unhealthy);

    service.shutdown(true).await;
}

#[tokio::test]
async fn test_duplicate_document_id_is_rejected_while_running() {
    let stuck = processor("index", Behaviour::WaitForCancel);
    let processors = vec![processor("parse", Behaviour::EchoInputs), stuck.clone()];
    let service = service(&processors, &ManualSampler::new());
    let id = DocumentId::new("doc-twice");

    let (first, second) = tokio::join!(
        service.process(Document::new("doc-twice", "/data/a")),
        async {
            wait_until(|| stuck.calls() == 1).await;
            let second = service
                .process(Document::new("doc-twice", "/data/b"))
                .await;
            let resumed = service.resume(&id).await;
            // The running document is still tracked and can be cancelled.
            assert_eq!(service.active_documents(), vec![id.clone()]);
            assert!(service.cancel(&id));
            (second, resumed)
        }
    );

    let (second, resumed) = second;
    match second {
        Err(ServiceError::AlreadyRunning { document_id }) => assert_eq!(document_id, id),
        other => panic!("expected duplicate rejection, got {:?}", other.map(|r| r.status)),
    }
    assert!(matches!(resumed, Err(ServiceError::AlreadyRunning { .. })));
    assert_eq!(first.unwrap().status, PipelineStatus::Cancelled);
    assert_eq!(processors[0].calls(), 1);
    assert_eq!(stuck.calls(), 1);

    assert!(service.active_documents().is_empty());

    service.shutdown(true).await;
}

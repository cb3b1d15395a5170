//! Bridge from worker pool telemetry to metrics.

use super::client::MetricsClient;
use crate::executor::{TelemetryEvent, TelemetrySink};

/// Telemetry sink that forwards lane rejections to the metrics daemon.
#[derive(Debug, Clone)]
pub struct MetricsTelemetrySink {
    client: MetricsClient,
}

impl MetricsTelemetrySink {
    pub fn new(client: MetricsClient) -> Self {
        Self { client }
    }
}

impl TelemetrySink for MetricsTelemetrySink {
    fn emit(&self, event: TelemetryEvent) {
        if let TelemetryEvent::TaskRejected { lane, .. } = event {
            self.client.task_rejected(lane);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::LaneKind;
    use crate::metrics::MetricEvent;
    use crate::pipeline::DocumentId;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_forwards_only_rejections() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = MetricsTelemetrySink::new(MetricsClient::new(tx));

        sink.emit(TelemetryEvent::PoolShutdown {
            graceful: true,
            drained: 0,
            cancelled: 0,
        });
        sink.emit(TelemetryEvent::TaskRejected {
            document_id: DocumentId::new("d"),
            stage: "ocr".into(),
            lane: LaneKind::CpuHeavy,
        });

        assert!(matches!(
            rx.try_recv(),
            Ok(MetricEvent::TaskRejected {
                lane: LaneKind::CpuHeavy
            })
        ));
        assert!(rx.try_recv().is_err());
    }
}

//! # Delivery Protocol
//!
//! Payloads exchanged with the callable function that stores samples.
//!
//! ## Wire Format
//! Callable functions wrap the argument in `data` and the return value in
//! `result` (or `error`):
//! ```json
//! → { "data": { "collection": "locations", "batchId": "…", "deviceId": "…",
//!               "device": "pixel-7", "documents": [ { "id": 1, "lat": …, … } ] } }
//! ← { "result": { "results": [ { "id": 1, "status": "accepted" },
//!                              { "id": 4, "status": "rejected", "reason": "…" } ] } }
//! ← { "error": { "status": "UNAUTHENTICATED", "message": "…" } }
//! ```
//!
//! The backend deduplicates on `(deviceId, id)`, so a batch that is sent
//! twice after a lost response is harmless.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use geotrack_core::{Batch, LocationSample, SampleId};

// =============================================================================
// Callable Envelope
// =============================================================================

/// Request envelope of a callable function.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallableRequest<T> {
    pub data: T,
}

/// Response envelope of a callable function.
#[derive(Debug, Clone, Deserialize)]
pub struct CallableResponse<T> {
    pub result: Option<T>,
    #[serde(default)]
    pub error: Option<CallableError>,
}

/// Error object returned by a callable function.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CallableError {
    /// Canonical status name, e.g. `UNAUTHENTICATED` or `INTERNAL`.
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub message: String,
}

impl CallableError {
    pub fn is_unauthenticated(&self) -> bool {
        matches!(self.status.as_str(), "UNAUTHENTICATED" | "PERMISSION_DENIED")
    }
}

// =============================================================================
// Batch Request
// =============================================================================

/// One stored document per sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationDocument {
    /// Local sequence number, the deduplication key.
    pub id: SampleId,
    pub lat: f64,
    pub lng: f64,
    /// Capture instant, epoch milliseconds.
    pub time: i64,
    pub provider: Option<String>,
    pub accuracy: f64,
    pub speed: Option<f64>,
    pub altitude: Option<f64>,
    pub bearing: Option<f64>,
    /// Device label.
    pub user: String,
    /// Send instant, epoch milliseconds.
    pub date: i64,
}

impl LocationDocument {
    pub fn from_sample(sample: &LocationSample, device_label: &str, sent_at: DateTime<Utc>) -> Self {
        LocationDocument {
            id: sample.id,
            lat: sample.latitude,
            lng: sample.longitude,
            time: sample.captured_at.timestamp_millis(),
            provider: sample.provider.clone(),
            accuracy: sample.accuracy_m,
            speed: sample.speed_mps,
            altitude: sample.altitude_m,
            bearing: sample.bearing_deg,
            user: device_label.to_string(),
            date: sent_at.timestamp_millis(),
        }
    }
}

/// Argument of the batch-submit call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitBatch {
    pub collection: String,
    /// Fresh for every attempt; only used for tracing on the backend.
    pub batch_id: Uuid,
    pub device_id: String,
    pub device: String,
    pub documents: Vec<LocationDocument>,
}

impl SubmitBatch {
    /// Builds the request for `samples`, keeping their (ascending) order.
    pub fn new(
        collection: &str,
        device_id: &str,
        device_label: &str,
        samples: &[LocationSample],
    ) -> Self {
        let sent_at = Utc::now();
        SubmitBatch {
            collection: collection.to_string(),
            batch_id: Uuid::new_v4(),
            device_id: device_id.to_string(),
            device: device_label.to_string(),
            documents: samples
                .iter()
                .map(|s| LocationDocument::from_sample(s, device_label, sent_at))
                .collect(),
        }
    }
}

// =============================================================================
// Batch Response
// =============================================================================

/// Per-sample verdict of the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Accepted,
    /// Malformed or otherwise unacceptable; never retried.
    Rejected,
    /// The backend could not store it right now.
    Retry,
}

/// Verdict for one document of a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleOutcome {
    pub id: SampleId,
    pub status: OutcomeStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl SampleOutcome {
    pub fn accepted(id: SampleId) -> Self {
        SampleOutcome { id, status: OutcomeStatus::Accepted, reason: None }
    }

    pub fn rejected(id: SampleId, reason: impl Into<String>) -> Self {
        SampleOutcome { id, status: OutcomeStatus::Rejected, reason: Some(reason.into()) }
    }

    pub fn retry(id: SampleId, reason: impl Into<String>) -> Self {
        SampleOutcome { id, status: OutcomeStatus::Retry, reason: Some(reason.into()) }
    }
}

/// Return value of the batch-submit call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchResult {
    #[serde(default)]
    pub results: Vec<SampleOutcome>,
}

// =============================================================================
// Reconciliation
// =============================================================================

/// Outcomes of one batch sorted into what the queue has to do with them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchAck {
    pub accepted: Vec<SampleId>,
    pub rejected: Vec<(SampleId, String)>,
    /// Ids the backend asked to resend, or did not mention at all.
    pub retry: Vec<(SampleId, String)>,
}

impl BatchAck {
    /// Matches `outcomes` against the ids that were actually sent.
    ///
    /// Unknown ids are ignored; for duplicates the first verdict wins.
    pub fn reconcile(batch: &Batch, outcomes: Vec<SampleOutcome>) -> Self {
        let mut ack = BatchAck::default();
        let mut seen = HashSet::with_capacity(batch.len());

        for outcome in outcomes {
            if !batch.contains(outcome.id) {
                warn!(sample_id = outcome.id, "Backend reported an id that was not sent");
                continue;
            }
            if !seen.insert(outcome.id) {
                warn!(sample_id = outcome.id, "Duplicate verdict ignored");
                continue;
            }
            match outcome.status {
                OutcomeStatus::Accepted => ack.accepted.push(outcome.id),
                OutcomeStatus::Rejected => ack.rejected.push((
                    outcome.id,
                    outcome.reason.unwrap_or_else(|| "rejected by backend".to_string()),
                )),
                OutcomeStatus::Retry => ack.retry.push((
                    outcome.id,
                    outcome.reason.unwrap_or_else(|| "backend asked to retry".to_string()),
                )),
            }
        }

        for &id in batch.ids() {
            if !seen.contains(&id) {
                ack.retry.push((id, "missing from backend response".to_string()));
            }
        }

        ack.accepted.sort_unstable();
        ack.rejected.sort_unstable_by_key(|(id, _)| *id);
        ack.retry.sort_unstable_by_key(|(id, _)| *id);
        ack
    }

    pub fn is_complete_success(&self) -> bool {
        self.rejected.is_empty() && self.retry.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use geotrack_core::DeliveryState;

    fn sample(id: SampleId) -> LocationSample {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 8, 30, 0).unwrap();
        LocationSample {
            id,
            captured_at: at,
            latitude: 48.85,
            longitude: 2.35,
            accuracy_m: 12.5,
            provider: Some("fused".into()),
            speed_mps: Some(1.2),
            altitude_m: None,
            bearing_deg: None,
            delivery_state: DeliveryState::InFlight,
            attempts: 0,
            failure_reason: None,
            last_error: None,
            created_at: at,
            updated_at: at,
            delivered_at: None,
        }
    }

    fn batch(ids: &[SampleId]) -> Batch {
        let samples: Vec<_> = ids.iter().map(|&id| sample(id)).collect();
        Batch::from_samples(&samples)
    }

    #[test]
    fn test_request_shape() {
        let request = CallableRequest {
            data: SubmitBatch::new("locations", "dev-1", "pixel-7", &[sample(1), sample(2)]),
        };
        let json = serde_json::to_value(&request).unwrap();

        assert_eq!(json["data"]["collection"], "locations");
        assert_eq!(json["data"]["deviceId"], "dev-1");
        assert_eq!(json["data"]["documents"][0]["id"], 1);
        assert_eq!(json["data"]["documents"][1]["id"], 2);
        assert_eq!(json["data"]["documents"][0]["lat"], 48.85);
        assert_eq!(json["data"]["documents"][0]["user"], "pixel-7");
        assert_eq!(json["data"]["documents"][0]["time"], 1714552200000_i64);
        assert!(json["data"]["documents"][0]["altitude"].is_null());
    }

    #[test]
    fn test_response_parsing() {
        let body = r#"{"result":{"results":[
            {"id":1,"status":"accepted"},
            {"id":4,"status":"rejected","reason":"latitude out of range"}
        ]}}"#;
        let response: CallableResponse<BatchResult> = serde_json::from_str(body).unwrap();
        let results = response.result.unwrap().results;
        assert_eq!(results[0], SampleOutcome::accepted(1));
        assert_eq!(results[1], SampleOutcome::rejected(4, "latitude out of range"));

        let body = r#"{"error":{"status":"UNAUTHENTICATED","message":"bad token"}}"#;
        let response: CallableResponse<BatchResult> = serde_json::from_str(body).unwrap();
        assert!(response.result.is_none());
        assert!(response.error.unwrap().is_unauthenticated());
    }

    #[test]
    fn test_reconcile_mixed_outcome() {
        let ack = BatchAck::reconcile(
            &batch(&[1, 2, 3, 4, 5]),
            vec![
                SampleOutcome::accepted(3),
                SampleOutcome::accepted(1),
                SampleOutcome::accepted(2),
                SampleOutcome::rejected(4, "malformed"),
            ],
        );

        assert_eq!(ack.accepted, vec![1, 2, 3]);
        assert_eq!(ack.rejected, vec![(4, "malformed".to_string())]);
        assert_eq!(ack.retry.len(), 1);
        assert_eq!(ack.retry[0].0, 5);
        assert!(!ack.is_complete_success());
    }

    #[test]
    fn test_reconcile_ignores_unknown_and_duplicates() {
        let ack = BatchAck::reconcile(
            &batch(&[7, 8]),
            vec![
                SampleOutcome::accepted(7),
                SampleOutcome::rejected(7, "late duplicate"),
                SampleOutcome::accepted(99),
                SampleOutcome::accepted(8),
            ],
        );

        assert_eq!(ack.accepted, vec![7, 8]);
        assert!(ack.is_complete_success());
    }
}

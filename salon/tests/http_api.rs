//! HTTP contract: routing, identity headers, status codes and error bodies.

#![allow(clippy::unwrap_used)] // Test code

use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode};
use chrono::{NaiveTime, TimeDelta};
use salon_queue::aggregates::NewBooking;
use salon_queue::api::principal::{STAFF_SALON_HEADER, USER_HEADER};
use salon_queue::app::{Collaborators, LaneSettings, QueueService};
use salon_queue::distribution::Hub;
use salon_queue::providers::{FixedTravelBuffers, InMemorySlotAvailability, InMemoryStaffDirectory};
use salon_queue::server::{AppState, build_router};
use salon_queue::types::{BookingId, SalonId, ServiceId, StaffId, StaffProfile, TimeWindow, UserId};
use salon_queue_core::environment::Clock;
use salon_queue_testing::helpers::at;
use salon_queue_testing::test_clock;
use serde_json::{Value, json};
use std::sync::Arc;
use tower::ServiceExt;

struct Api {
    router: Router,
    slots: Arc<InMemorySlotAvailability>,
    salon_id: SalonId,
    staff_id: StaffId,
    service_id: ServiceId,
}

enum As {
    Nobody,
    Customer(UserId),
    Staff(SalonId),
}

impl Api {
    fn new() -> Self {
        let salon_id = SalonId::new();
        let staff_id = StaffId::new();
        let slots = Arc::new(InMemorySlotAvailability::new());
        let service = QueueService::new(
            Collaborators {
                clock: Arc::new(test_clock()),
                directory: Arc::new(InMemoryStaffDirectory::with_staff([StaffProfile {
                    staff_id,
                    salon_id,
                    name: "Ana".to_string(),
                }])),
                slots: slots.clone(),
                travel: Arc::new(FixedTravelBuffers::new(TimeDelta::minutes(20))),
            },
            Arc::new(Hub::new()),
            LaneSettings::default(),
        );

        Self {
            router: build_router(AppState::new(Arc::new(service))),
            slots,
            salon_id,
            staff_id,
            service_id: ServiceId::new(),
        }
    }

    async fn call(&self, method: &str, uri: &str, caller: &As, body: Option<Value>) -> (StatusCode, Value) {
        let mut request = Request::builder().method(method).uri(uri);
        request = match caller {
            As::Nobody => request,
            As::Customer(user_id) => request.header(USER_HEADER, user_id.to_string()),
            As::Staff(salon_id) => request.header(STAFF_SALON_HEADER, salon_id.to_string()),
        };
        let request = match body {
            Some(body) => request
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => request.body(Body::empty()).unwrap(),
        };

        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, value)
    }

    fn join_body(&self) -> Value {
        json!({
            "salon_id": self.salon_id,
            "service_id": self.service_id,
            "requested_date": self.date(),
            "window": { "start": "09:00:00", "end": "18:00:00" },
            "flexibility_days": 1,
        })
    }

    fn date(&self) -> chrono::NaiveDate {
        test_clock().now().date_naive() + TimeDelta::days(3)
    }
}

#[tokio::test]
async fn health_and_readiness_respond() {
    let api = Api::new();

    let (status, body) = api.call("GET", "/health", &As::Nobody, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");

    let (status, body) = api.call("GET", "/ready", &As::Nobody, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ready"], true);
}

#[tokio::test]
async fn joining_requires_a_customer() {
    let api = Api::new();

    let (status, body) = api.call("POST", "/waitlist", &As::Nobody, Some(api.join_body())).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], "UNAUTHORIZED");

    let (status, _) = api
        .call("POST", "/waitlist", &As::Staff(api.salon_id), Some(api.join_body()))
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, body) = api
        .call("POST", "/waitlist", &As::Customer(UserId::new()), Some(api.join_body()))
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["status"], "active");
    assert_eq!(body["position"], 1);
}

#[tokio::test]
async fn join_with_open_slots_is_a_conflict() {
    let api = Api::new();
    let window = TimeWindow::new(
        NaiveTime::from_hms_opt(10, 0, 0).unwrap(),
        NaiveTime::from_hms_opt(11, 0, 0).unwrap(),
    )
    .unwrap();
    api.slots
        .open(api.salon_id, api.service_id, api.staff_id, api.date(), window);

    let (status, body) = api
        .call("POST", "/waitlist", &As::Customer(UserId::new()), Some(api.join_body()))
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "SLOTS_AVAILABLE");
}

#[tokio::test]
async fn released_slot_can_be_accepted_over_http() {
    let api = Api::new();
    let user_id = UserId::new();
    let (_, entry) = api
        .call("POST", "/waitlist", &As::Customer(user_id), Some(api.join_body()))
        .await;
    let entry_id = entry["entry_id"].as_str().unwrap().to_string();

    let release = json!({
        "salon_id": api.salon_id,
        "service_id": api.service_id,
        "staff_id": api.staff_id,
        "date": api.date(),
        "window": { "start": "14:00:00", "end": "15:00:00" },
    });
    let (status, _) = api
        .call("POST", "/slots/released", &As::Customer(user_id), Some(release.clone()))
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    let (status, body) = api
        .call("POST", "/slots/released", &As::Staff(api.salon_id), Some(release))
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert!(body["release_id"].is_string());

    let (status, body) = api
        .call("GET", &format!("/waitlist/{entry_id}"), &As::Customer(user_id), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "notified");

    let (status, body) = api
        .call(
            "POST",
            &format!("/waitlist/{entry_id}/response"),
            &As::Customer(user_id),
            Some(json!({ "accept": true })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "accepted");

    let (status, body) = api
        .call(
            "POST",
            &format!("/waitlist/{entry_id}/response"),
            &As::Customer(user_id),
            Some(json!({ "accept": true })),
        )
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "NO_PENDING_OFFER");
}

#[tokio::test]
async fn strangers_see_entries_as_missing() {
    let api = Api::new();
    let (_, entry) = api
        .call("POST", "/waitlist", &As::Customer(UserId::new()), Some(api.join_body()))
        .await;
    let entry_id = entry["entry_id"].as_str().unwrap().to_string();

    let (status, body) = api
        .call("DELETE", &format!("/waitlist/{entry_id}"), &As::Customer(UserId::new()), None)
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "ENTRY_NOT_FOUND");

    let (status, body) = api
        .call("DELETE", &format!("/waitlist/{entry_id}"), &As::Staff(api.salon_id), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "cancelled");
}

#[tokio::test]
async fn appointment_events_are_staff_only() {
    let api = Api::new();
    let booking = NewBooking {
        booking_id: BookingId::new(),
        user_id: UserId::new(),
        scheduled_start: at(test_clock().now(), 30),
        duration_minutes: 45,
    };
    let event = json!({ "type": "inserted", "booking": booking });
    let uri = format!("/appointments/{}/events", api.staff_id);

    let (status, _) = api
        .call("POST", &uri, &As::Customer(booking.user_id), Some(event.clone()))
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = api
        .call("POST", &uri, &As::Staff(SalonId::new()), Some(event.clone()))
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, body) = api
        .call("POST", &uri, &As::Staff(api.salon_id), Some(event))
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["applied"], true);

    let (status, body) = api
        .call(
            "PUT",
            &format!("/staff/{}/status", api.staff_id),
            &As::Staff(api.salon_id),
            Some(json!({ "status": "on_break" })),
        )
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["applied"], true);

    let (status, body) = api
        .call(
            "GET",
            &format!("/snapshots/salon:{}", api.salon_id),
            &As::Staff(api.salon_id),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["kind"], "salon");
    assert_eq!(body["queues"][0]["current_status"], "on_break");
}

#[tokio::test]
async fn snapshots_are_authorized_like_subscriptions() {
    let api = Api::new();
    let user_id = UserId::new();

    let (status, _) = api
        .call(
            "GET",
            &format!("/snapshots/salon:{}", api.salon_id),
            &As::Customer(user_id),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, body) = api
        .call("GET", &format!("/snapshots/user:{user_id}"), &As::Customer(user_id), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["kind"], "user");

    let (status, body) = api
        .call("GET", "/snapshots/table:7", &As::Customer(user_id), None)
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "MALFORMED_TOPIC");
}

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{Framed, LinesCodec};
use ulid::Ulid;

use cottage_ledger::engine::{Engine, LedgerOptions};
use cottage_ledger::limits::MAX_LINE_LEN;
use cottage_ledger::notify::NotifyHub;
use cottage_ledger::wire;

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("cottage_ledger_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let engine = Arc::new(
        Engine::new(dir.join("ledger.wal"), Arc::new(NotifyHub::new()), LedgerOptions::default()).unwrap(),
    );

    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let engine = engine.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, engine).await;
            });
        }
    });

    addr
}

struct Client {
    framed: Framed<TcpStream, LinesCodec>,
    notifications: Vec<Value>,
}

impl Client {
    async fn connect(addr: SocketAddr) -> Self {
        let socket = TcpStream::connect(addr).await.unwrap();
        Self {
            framed: Framed::new(socket, LinesCodec::new_with_max_length(4 * MAX_LINE_LEN)),
            notifications: Vec::new(),
        }
    }

    async fn next_line(&mut self) -> Value {
        let line = tokio::time::timeout(Duration::from_secs(5), self.framed.next())
            .await
            .expect("timed out waiting for a line")
            .expect("connection closed")
            .unwrap();
        serde_json::from_str(&line).unwrap()
    }

    /// Send one request and return its response, setting aside any notifications.
    async fn call(&mut self, request: Value) -> Value {
        self.framed.send(request.to_string()).await.unwrap();
        self.response().await
    }

    async fn response(&mut self) -> Value {
        loop {
            let value = self.next_line().await;
            if value.get("ok").is_some() {
                return value;
            }
            self.notifications.push(value);
        }
    }

    async fn ok(&mut self, request: Value) -> Value {
        let resp = self.call(request).await;
        assert_eq!(resp["ok"], true, "{resp}");
        resp["data"].clone()
    }

    async fn notification(&mut self) -> Value {
        if !self.notifications.is_empty() {
            return self.notifications.remove(0);
        }
        self.next_line().await
    }
}

async fn create_cottage(client: &mut Client, name: &str, base_capacity: u32) -> String {
    let data = client
        .ok(json!({
            "op": "create_cottage",
            "name": name,
            "category": "luxury",
            "base_capacity": base_capacity,
            "price_per_night": "180.00",
        }))
        .await;
    data["id"].as_str().unwrap().to_string()
}

fn reservation(cottage_id: &str, check_in: &str, check_out: &str, caller: &str) -> Value {
    json!({
        "op": "create_reservation",
        "caller": caller,
        "cottage_id": cottage_id,
        "check_in": check_in,
        "check_out": check_out,
        "customer_name": "John Doe",
        "customer_email": "john.doe@example.com",
    })
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn booking_flow_end_to_end() {
    let addr = start_test_server().await;
    let mut c = Client::connect(addr).await;

    let cid = create_cottage(&mut c, "Lakeside", 4).await;
    let bed = c
        .ok(json!({"op": "create_amenity", "caller": "admin", "name": "Sofa bed", "additional_capacity": 2}))
        .await;
    let cot = c
        .ok(json!({"op": "create_amenity", "caller": "admin", "name": "Cot", "additional_capacity": 1}))
        .await;
    c.ok(json!({"op": "attach_amenity", "cottage_id": cid, "amenity_id": bed["id"]})).await;
    let info = c.ok(json!({"op": "attach_amenity", "cottage_id": cid, "amenity_id": cot["id"]})).await;
    assert_eq!(info["total_capacity"], 7);
    assert_eq!(info["price_per_night"], "180.00");

    let first = c.ok(reservation(&cid, "2024-10-01", "2024-10-05", "user-1")).await;
    assert_eq!(first["confirmed"], true);
    assert_eq!(first["stay"]["check_in"], "2024-10-01");

    let clash = c.call(reservation(&cid, "2024-10-04", "2024-10-06", "user-2")).await;
    assert_eq!(clash["ok"], false);
    assert_eq!(clash["error"]["kind"], "conflict");
    assert_eq!(clash["error"]["status"], 409);

    c.ok(reservation(&cid, "2024-10-05", "2024-10-08", "user-2")).await;

    let avail = c
        .ok(json!({"op": "check_availability", "cottage_id": cid, "check_in": "2024-10-02", "check_out": "2024-10-03"}))
        .await;
    assert_eq!(avail["available"], false);
    assert_eq!(avail["message"], "The cottage is not available for the selected dates.");

    c.ok(json!({"op": "cancel_reservation", "id": first["id"]})).await;
    let avail = c
        .ok(json!({"op": "check_availability", "cottage_id": cid, "check_in": "2024-10-02", "check_out": "2024-10-03"}))
        .await;
    assert_eq!(avail["available"], true);

    let mine = c.ok(json!({"op": "list_reservations", "caller": "user-2"})).await;
    assert_eq!(mine.as_array().unwrap().len(), 1);

    let gaps = c
        .ok(json!({"op": "vacancies", "cottage_id": cid, "from": "2024-10-01", "to": "2024-10-10"}))
        .await;
    assert_eq!(
        gaps,
        json!([
            {"check_in": "2024-10-01", "check_out": "2024-10-05"},
            {"check_in": "2024-10-08", "check_out": "2024-10-10"},
        ])
    );
}

#[tokio::test]
async fn validation_failure_lists_fields() {
    let addr = start_test_server().await;
    let mut c = Client::connect(addr).await;
    let cid = create_cottage(&mut c, "Lakeside", 4).await;

    let resp = c
        .call(json!({
            "op": "create_reservation",
            "caller": "user-1",
            "cottage_id": cid,
            "check_in": "2024-10-05",
            "check_out": "2024-10-01",
            "customer_name": "",
            "customer_email": "nope",
        }))
        .await;
    assert_eq!(resp["ok"], false);
    assert_eq!(resp["error"]["kind"], "invalid");
    let fields: Vec<&str> = resp["error"]["violations"]
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v["field"].as_str().unwrap())
        .collect();
    assert_eq!(fields, vec!["customer_email", "customer_name", "non_field_errors"]);
}

#[tokio::test]
async fn racing_clients_get_exactly_one_booking() {
    let addr = start_test_server().await;
    let mut setup = Client::connect(addr).await;
    let cid = create_cottage(&mut setup, "Lakeside", 4).await;

    let mut handles = Vec::new();
    for i in 0..16 {
        let cid = cid.clone();
        handles.push(tokio::spawn(async move {
            let mut c = Client::connect(addr).await;
            c.call(reservation(&cid, "2024-12-24", "2024-12-27", &format!("user-{i}"))).await
        }));
    }

    let mut wins = 0;
    for h in handles {
        let resp = h.await.unwrap();
        if resp["ok"] == true {
            wins += 1;
        } else {
            assert_eq!(resp["error"]["kind"], "conflict");
        }
    }
    assert_eq!(wins, 1);

    let listed = setup.ok(json!({"op": "list_reservations", "cottage_id": cid})).await;
    assert_eq!(listed.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn subscriber_sees_other_connections_changes() {
    let addr = start_test_server().await;
    let mut watcher = Client::connect(addr).await;
    let mut writer = Client::connect(addr).await;
    let cid = create_cottage(&mut writer, "Lakeside", 4).await;

    watcher.ok(json!({"op": "subscribe", "cottage_id": cid})).await;
    let booked = writer.ok(reservation(&cid, "2024-10-01", "2024-10-05", "user-1")).await;

    let note = watcher.notification().await;
    assert_eq!(note["cottage_id"], cid.as_str());
    assert_eq!(note["event"]["ReservationAdmitted"]["id"], booked["id"]);

    writer.ok(json!({"op": "delete_cottage", "id": cid})).await;
    let note = watcher.notification().await;
    assert!(note["event"]["CottageDeleted"].is_object(), "{note}");
}

#[tokio::test]
async fn malformed_line_keeps_connection_open() {
    let addr = start_test_server().await;
    let mut c = Client::connect(addr).await;

    let resp = c.call(json!({"op": "no_such_op"})).await;
    assert_eq!(resp["ok"], false);
    assert_eq!(resp["error"]["status"], 400);

    let cottages = c.ok(json!({"op": "list_cottages"})).await;
    assert_eq!(cottages, json!([]));
}

#[tokio::test]
async fn oversized_line_is_answered_then_closed() {
    let addr = start_test_server().await;
    let mut c = Client::connect(addr).await;

    let huge = format!(r#"{{"op":"create_cottage","name":"{}"}}"#, "x".repeat(MAX_LINE_LEN + 10));
    c.framed.send(huge).await.unwrap();
    let resp = c.response().await;
    assert_eq!(resp["ok"], false);
    assert!(resp["error"]["message"].as_str().unwrap().contains("exceeds"));

    let closed = tokio::time::timeout(Duration::from_secs(5), c.framed.next()).await.unwrap();
    assert!(closed.is_none() || closed.is_some_and(|r| r.is_err()));
}

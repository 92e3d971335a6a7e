use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_postgres::{Client, Config, NoTls, SimpleQueryMessage, SimpleQueryRow};
use ulid::Ulid;

use daybook::auth::ServiceCredentials;
use daybook::engine::{Engine, HoldPolicy};
use daybook::wire;

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server(policy: HoldPolicy) -> (SocketAddr, Arc<Engine>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("daybook_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let engine = Arc::new(Engine::new(dir.join("daybook.wal"), policy).unwrap());

    let server_engine = engine.clone();
    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let engine = server_engine.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, engine, ServiceCredentials::new("daybook"), None).await;
            });
        }
    });

    (addr, engine)
}

async fn connect_with(addr: SocketAddr, password: &str) -> Result<Client, tokio_postgres::Error> {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname("daybook")
        .user("app")
        .password(password);

    let (client, connection) = config.connect(NoTls).await?;
    tokio::spawn(async move {
        let _ = connection.await;
    });
    Ok(client)
}

async fn connect(addr: SocketAddr) -> Client {
    connect_with(addr, "daybook").await.unwrap()
}

async fn rows(client: &Client, sql: &str) -> Vec<SimpleQueryRow> {
    client
        .simple_query(sql)
        .await
        .unwrap()
        .into_iter()
        .filter_map(|m| match m {
            SimpleQueryMessage::Row(row) => Some(row),
            _ => None,
        })
        .collect()
}

async fn sqlstate(client: &Client, sql: &str) -> String {
    let err = client.simple_query(sql).await.unwrap_err();
    err.code().expect("database error").code().to_string()
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn booking_then_availability() {
    let (addr, _engine) = start_test_server(HoldPolicy::Checked).await;
    let client = connect(addr).await;

    client
        .simple_query("INSERT INTO bookings VALUES (1, 10, '2024-02-01', '2024-02-02')")
        .await
        .unwrap();
    client
        .simple_query("INSERT INTO bookings (item_id, holder_id, start_date, end_date) VALUES (1, 11, '2024-02-05', '2024-02-05')")
        .await
        .unwrap();

    let calendar = rows(&client, "SELECT * FROM availability WHERE item_id = 1").await;
    let dates: Vec<&str> = calendar.iter().map(|r| r.get("booked_date").unwrap()).collect();
    assert_eq!(dates, vec!["2024-02-01", "2024-02-02", "2024-02-05"]);
    assert!(calendar.iter().all(|r| r.get("item_id") == Some("1")));
}

#[tokio::test]
async fn overlapping_booking_reports_conflict() {
    let (addr, _engine) = start_test_server(HoldPolicy::Checked).await;
    let client = connect(addr).await;

    client
        .simple_query("INSERT INTO bookings VALUES (2, 10, '2024-03-01', '2024-03-05')")
        .await
        .unwrap();
    let code = sqlstate(&client, "INSERT INTO bookings VALUES (2, 11, '2024-03-05', '2024-03-06')").await;
    assert_eq!(code, "23P01");

    let code = sqlstate(&client, "INSERT INTO bookings VALUES (2, 11, '2024-03-09', '2024-03-08')").await;
    assert_eq!(code, "22023");
}

#[tokio::test]
async fn returning_then_cancel() {
    let (addr, engine) = start_test_server(HoldPolicy::Checked).await;
    let client = connect(addr).await;

    let created = rows(
        &client,
        "INSERT INTO bookings VALUES (3, 10, '2024-04-01', '2024-04-03') RETURNING *",
    )
    .await;
    assert_eq!(created.len(), 1);
    assert_eq!(created[0].get("status"), Some("confirmed"));
    assert_eq!(created[0].get("start_date"), Some("2024-04-01"));
    let id = created[0].get("id").unwrap().to_string();

    client
        .simple_query(&format!("DELETE FROM bookings WHERE id = '{id}'"))
        .await
        .unwrap();
    assert!(rows(&client, "SELECT * FROM availability WHERE item_id = 3").await.is_empty());

    let listed = rows(&client, "SELECT * FROM reservations WHERE item_id = 3").await;
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].get("status"), Some("cancelled"));
    assert_eq!(engine.list_confirmed(3).await.len(), 0);

    let code = sqlstate(
        &client,
        &format!("DELETE FROM reservations WHERE id = '{}'", Ulid::new()),
    )
    .await;
    assert_eq!(code, "P0002");
}

#[tokio::test]
async fn holds_block_bookings() {
    let (addr, _engine) = start_test_server(HoldPolicy::Checked).await;
    let client = connect(addr).await;

    let hold = rows(
        &client,
        "INSERT INTO holds VALUES (4, '2024-05-10', '2024-05-12') RETURNING *",
    )
    .await;
    assert_eq!(hold[0].get("holder_id"), Some("0"));
    assert_eq!(hold[0].get("is_hold"), Some("t"));

    let err = client
        .simple_query("INSERT INTO bookings VALUES (4, 10, '2024-05-12', '2024-05-14')")
        .await
        .unwrap_err();
    let db = err.as_db_error().unwrap();
    assert!(db.message().contains("blocked"), "{}", db.message());
}

#[tokio::test]
async fn override_policy_stacks_holds() {
    let (addr, _engine) = start_test_server(HoldPolicy::Override).await;
    let client = connect(addr).await;

    client
        .simple_query("INSERT INTO bookings VALUES (5, 10, '2024-06-01', '2024-06-02')")
        .await
        .unwrap();
    client
        .simple_query("INSERT INTO holds VALUES (5, '2024-06-02', '2024-06-03')")
        .await
        .unwrap();
    assert_eq!(rows(&client, "SELECT * FROM availability WHERE item_id = 5").await.len(), 3);
}

#[tokio::test]
async fn extended_protocol_insert() {
    let (addr, engine) = start_test_server(HoldPolicy::Checked).await;
    let client = connect(addr).await;

    let inserted = client
        .execute(
            "INSERT INTO bookings VALUES ($1, $2, $3, $4)",
            &[&"6", &"10", &"2024-07-01", &"2024-07-04"],
        )
        .await
        .unwrap();
    assert_eq!(inserted, 1);
    assert_eq!(engine.availability(6).await.count, 4);
}

#[tokio::test]
async fn health_and_parse_errors() {
    let (addr, _engine) = start_test_server(HoldPolicy::Checked).await;
    let client = connect(addr).await;

    let health = rows(&client, "SELECT * FROM health").await;
    assert_eq!(health[0].get("status"), Some("ok"));

    assert_eq!(sqlstate(&client, "SELEC nonsense").await, "42601");
    assert_eq!(sqlstate(&client, "SELECT * FROM availability").await, "42601");
}

#[tokio::test]
async fn wrong_password_rejected() {
    let (addr, _engine) = start_test_server(HoldPolicy::Checked).await;
    assert!(connect_with(addr, "nope").await.is_err());
}

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_postgres::{Client, Config, NoTls, SimpleQueryMessage, SimpleQueryRow};
use ulid::Ulid;

use courtbook::clock::FixedClock;
use courtbook::config::BookingPolicy;
use courtbook::facility::FacilityManager;
use courtbook::model::parse_date;
use courtbook::wire;

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("courtbook_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let today = parse_date("2025-08-20").unwrap();
    let fm = Arc::new(FacilityManager::with_clock(
        dir,
        1000,
        BookingPolicy::default(),
        Arc::new(FixedClock(today)),
    ));

    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let fm = fm.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, fm, "courtbook".to_string()).await;
            });
        }
    });

    addr
}

async fn connect(addr: SocketAddr, facility: &str) -> Client {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname(facility)
        .user("frontdesk")
        .password("courtbook");

    let (client, connection) = config.connect(NoTls).await.unwrap();
    tokio::spawn(async move {
        let _ = connection.await;
    });
    client
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

async fn exec(client: &Client, sql: &str) {
    client.simple_query(sql).await.unwrap();
}

async fn error_code(client: &Client, sql: &str) -> String {
    let err = client.simple_query(sql).await.unwrap_err();
    err.code().map(|c| c.code().to_string()).unwrap_or_default()
}

/// Coach open Monday 09:00-12:00 and a member holding a two-credit ticket.
async fn seed(client: &Client) -> (Ulid, Ulid, Ulid) {
    let coach = Ulid::new();
    let member = Ulid::new();
    let ticket = Ulid::new();
    exec(client, &format!("INSERT INTO coaches (id, name) VALUES ('{coach}', 'Kim')")).await;
    exec(
        client,
        &format!(
            "INSERT INTO weekly_hours (coach_id, day_of_week, start_time, end_time, available) \
             VALUES ('{coach}', 1, '09:00', '12:00', true)"
        ),
    )
    .await;
    exec(
        client,
        &format!(
            "INSERT INTO tickets (id, user_id, remaining_count, expires_at) \
             VALUES ('{ticket}', '{member}', 2, '2025-12-31')"
        ),
    )
    .await;
    (coach, member, ticket)
}

fn reserve_sql(id: Ulid, coach: Ulid, member: Ulid, ticket: Ulid, start: &str, end: &str) -> String {
    format!(
        "INSERT INTO reservations (id, coach_id, user_id, user_ticket_id, date, start_time, end_time, memo) \
         VALUES ('{id}', '{coach}', '{member}', '{ticket}', '2025-08-25', '{start}', '{end}', 'serve practice')"
    )
}

async fn remaining(client: &Client, member: Ulid) -> String {
    let tickets = rows(client, &format!("SELECT * FROM tickets WHERE user_id = '{member}'")).await;
    tickets[0].get("remaining_count").unwrap().to_string()
}

// ── Tests ─────────────────────────────────────────────────────

#[tokio::test]
async fn booking_round_trip_over_the_wire() {
    let addr = start_test_server().await;
    let client = connect(addr, "club").await;
    let (coach, member, ticket) = seed(&client).await;

    let slots = rows(
        &client,
        &format!("SELECT * FROM slots WHERE coach_id = '{coach}' AND date = '2025-08-25'"),
    )
    .await;
    assert_eq!(slots.len(), 9);
    assert_eq!(slots[0].get("start_time"), Some("09:00"));
    assert_eq!(slots[0].get("status"), Some("available"));
    assert_eq!(slots[0].get("duration_label"), Some("20min"));
    assert_eq!(slots[0].get("period"), Some("morning"));

    let booking = Ulid::new();
    exec(&client, &reserve_sql(booking, coach, member, ticket, "09:00", "09:20")).await;

    let slots = rows(
        &client,
        &format!("SELECT * FROM slots WHERE coach_id = '{coach}' AND date = '2025-08-25'"),
    )
    .await;
    assert_eq!(slots[0].get("status"), Some("unavailable"));
    assert_eq!(slots[1].get("status"), Some("available"));
    assert_eq!(remaining(&client, member).await, "1");

    let calendar = rows(
        &client,
        &format!(
            "SELECT * FROM reservations WHERE coach_id = '{coach}' \
             AND date >= '2025-08-01' AND date <= '2025-08-31'"
        ),
    )
    .await;
    assert_eq!(calendar.len(), 1);
    let id = booking.to_string();
    assert_eq!(calendar[0].get("id"), Some(id.as_str()));
    assert_eq!(calendar[0].get("status"), Some("confirmed"));
    assert_eq!(calendar[0].get("memo"), Some("serve practice"));

    exec(
        &client,
        &format!("INSERT INTO status_updates (reservation_id, status) VALUES ('{booking}', 'completed')"),
    )
    .await;
    let calendar = rows(
        &client,
        &format!("SELECT * FROM reservations WHERE coach_id = '{coach}' AND date = '2025-08-25'"),
    )
    .await;
    assert_eq!(calendar[0].get("status"), Some("completed"));

    // Completed is final.
    let code = error_code(
        &client,
        &format!("INSERT INTO status_updates (reservation_id, status) VALUES ('{booking}', 'cancelled')"),
    )
    .await;
    assert_eq!(code, "P0001");
}

#[tokio::test]
async fn conflicting_and_misaligned_bookings_rejected() {
    let addr = start_test_server().await;
    let client = connect(addr, "club").await;
    let (coach, member, ticket) = seed(&client).await;

    exec(&client, &reserve_sql(Ulid::new(), coach, member, ticket, "10:00", "10:20")).await;

    let same_slot = reserve_sql(Ulid::new(), coach, member, ticket, "10:00", "10:20");
    assert_eq!(error_code(&client, &same_slot).await, "P0001");

    let off_grid = reserve_sql(Ulid::new(), coach, member, ticket, "09:10", "09:30");
    assert_eq!(error_code(&client, &off_grid).await, "P0001");

    let backwards = reserve_sql(Ulid::new(), coach, member, ticket, "11:00", "10:40");
    assert_eq!(error_code(&client, &backwards).await, "P0001");

    // None of the failures consumed a credit.
    assert_eq!(remaining(&client, member).await, "1");
}

#[tokio::test]
async fn cancel_via_delete_refunds_and_frees_slot() {
    let addr = start_test_server().await;
    let client = connect(addr, "club").await;
    let (coach, member, ticket) = seed(&client).await;

    let booking = Ulid::new();
    exec(&client, &reserve_sql(booking, coach, member, ticket, "11:40", "12:00")).await;
    assert_eq!(remaining(&client, member).await, "1");

    exec(&client, &format!("DELETE FROM reservations WHERE id = '{booking}'")).await;
    assert_eq!(remaining(&client, member).await, "2");

    let hidden = rows(
        &client,
        &format!("SELECT * FROM reservations WHERE coach_id = '{coach}' AND date = '2025-08-25'"),
    )
    .await;
    assert!(hidden.is_empty());

    let shown = rows(
        &client,
        &format!(
            "SELECT * FROM reservations WHERE coach_id = '{coach}' AND date = '2025-08-25' \
             AND include_cancelled = true"
        ),
    )
    .await;
    assert_eq!(shown.len(), 1);
    assert_eq!(shown[0].get("status"), Some("cancelled"));
    assert_eq!(shown[0].get("status_reason"), Some("cancelled by coach"));

    // The slot is bookable again.
    exec(&client, &reserve_sql(Ulid::new(), coach, member, ticket, "11:40", "12:00")).await;
}

#[tokio::test]
async fn overlapping_weekly_hours_rejected() {
    let addr = start_test_server().await;
    let client = connect(addr, "club").await;
    let (coach, _, _) = seed(&client).await;

    let overlapping = format!(
        "INSERT INTO weekly_hours (coach_id, day_of_week, start_time, end_time) \
         VALUES ('{coach}', 1, '09:00', '11:00'), ('{coach}', 1, '10:30', '12:00')"
    );
    assert_eq!(error_code(&client, &overlapping).await, "P0001");

    // The previous template is untouched.
    let hours = rows(
        &client,
        &format!("SELECT * FROM weekly_hours WHERE coach_id = '{coach}' AND day_of_week = 1"),
    )
    .await;
    assert_eq!(hours.len(), 1);
    assert_eq!(hours[0].get("end_time"), Some("12:00"));

    exec(&client, &format!("DELETE FROM weekly_hours WHERE coach_id = '{coach}'")).await;
    let hours = rows(&client, &format!("SELECT * FROM weekly_hours WHERE coach_id = '{coach}'")).await;
    assert!(hours.is_empty());
}

#[tokio::test]
async fn facilities_do_not_share_state() {
    let addr = start_test_server().await;
    let north = connect(addr, "north").await;
    let south = connect(addr, "south").await;
    seed(&north).await;

    assert_eq!(rows(&north, "SELECT * FROM coaches").await.len(), 1);
    assert!(rows(&south, "SELECT * FROM coaches").await.is_empty());
}

#[tokio::test]
async fn malformed_sql_is_syntax_error() {
    let addr = start_test_server().await;
    let client = connect(addr, "club").await;

    assert_eq!(error_code(&client, "SELEKT nothing").await, "42601");
    assert_eq!(error_code(&client, "SELECT * FROM courts").await, "42601");
    let two_coaches = format!(
        "INSERT INTO coaches (id, name) VALUES ('{}', 'Kim'), ('{}', 'Lee')",
        Ulid::new(),
        Ulid::new()
    );
    assert_eq!(error_code(&client, &two_coaches).await, "42601");
    assert!(rows(&client, "SELECT * FROM coaches").await.is_empty());
    let unknown = format!("DELETE FROM coaches WHERE id = '{}'", Ulid::new());
    assert_eq!(error_code(&client, &unknown).await, "P0001");
}

#[tokio::test]
async fn extended_protocol_binds_parameters() {
    let addr = start_test_server().await;
    let client = connect(addr, "club").await;
    let (coach, _, _) = seed(&client).await;

    let coach_id = coach.to_string();
    let slots = client
        .query(
            "SELECT * FROM slots WHERE coach_id = $1 AND date = $2",
            &[&coach_id, &"2025-08-25"],
        )
        .await
        .unwrap();
    assert_eq!(slots.len(), 9);
    let last: String = slots[8].get("end_time");
    assert_eq!(last, "12:00");
}

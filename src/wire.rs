use std::fmt::Debug;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::stream;
use futures::Sink;
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{DefaultServerParameterProvider, StartupHandler};
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldFormat, FieldInfo,
    QueryResponse, Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use tokio::net::TcpStream;
use ulid::Ulid;

use crate::auth::CourtbookAuthSource;
use crate::engine::{parse_interval, parse_time_range, DayPeriod, Engine, NewReservation, ScheduleQuery};
use crate::facility::FacilityManager;
use crate::model::*;
use crate::observability;
use crate::sql::{self, Command};

/// Wire clients are trusted front-office software and act as facility staff.
const WIRE_CALLER: Caller = Caller {
    user_id: Ulid::nil(),
    role: Role::FacilityAdmin,
};

pub struct CourtbookHandler {
    facilities: Arc<FacilityManager>,
    query_parser: Arc<CourtbookQueryParser>,
}

impl CourtbookHandler {
    pub fn new(facilities: Arc<FacilityManager>) -> Self {
        Self {
            facilities,
            query_parser: Arc::new(CourtbookQueryParser),
        }
    }

    fn resolve_engine<C: ClientInfo>(&self, client: &C) -> PgWireResult<Arc<Engine>> {
        let db = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        self.facilities.get_or_create(&db).map_err(|e| {
            PgWireError::UserError(Box::new(ErrorInfo::new(
                "ERROR".into(),
                "08006".into(),
                format!("facility error: {e}"),
            )))
        })
    }

    /// Parse, execute and record query metrics.
    async fn run(&self, engine: &Engine, query: &str) -> PgWireResult<Response> {
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        let label = observability::command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(engine, cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(&self, engine: &Engine, cmd: Command) -> PgWireResult<Response> {
        match cmd {
            Command::InsertCoach { id, name } => {
                engine.create_coach(id, name).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::DeleteCoach { id } => {
                engine.delete_coach(id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::InsertWeeklyHours { coach_id, day, rows } => {
                let count = rows.len();
                let intervals = rows
                    .iter()
                    .map(|r| parse_interval(&r.start_time, &r.end_time, r.available))
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(engine_err)?;
                engine
                    .set_weekly_hours(coach_id, day, intervals)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(count)))
            }
            Command::DeleteWeeklyHours { coach_id, day } => {
                match day {
                    Some(day) => engine.clear_weekly_day(coach_id, day).await,
                    None => engine.clear_weekly_hours(coach_id).await,
                }
                .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE")))
            }
            Command::InsertTicket {
                id,
                user_id,
                remaining_count,
                expires_at,
            } => {
                engine
                    .issue_ticket(id, user_id, remaining_count, expires_at)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::InsertReservation {
                id,
                coach_id,
                user_id,
                user_ticket_id,
                date,
                start_time,
                end_time,
                memo,
            } => {
                let span = parse_time_range(&start_time, &end_time).map_err(engine_err)?;
                let req = NewReservation {
                    id,
                    coach_id,
                    user_id,
                    user_ticket_id,
                    date,
                    span,
                    memo,
                    override_hours: false,
                };
                engine
                    .create_reservation(&WIRE_CALLER, req)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::InsertStatusUpdate {
                reservation_id,
                status,
                reason,
            } => {
                engine
                    .update_status(&WIRE_CALLER, reservation_id, status, reason)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::DeleteReservation { id } => {
                engine
                    .cancel_reservation(&WIRE_CALLER, id, None)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::SelectSlots {
                coach_id,
                date,
                lesson_minutes,
            } => {
                let slots = engine
                    .available_slots(coach_id, date, lesson_minutes)
                    .await
                    .map_err(engine_err)?;
                let schema = Arc::new(slots_schema());
                let rows: Vec<PgWireResult<_>> = slots
                    .into_iter()
                    .map(|slot| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&slot.start())?;
                        encoder.encode_field(&slot.end())?;
                        encoder.encode_field(&slot.status.as_str().to_string())?;
                        encoder.encode_field(&slot.duration_label.unwrap_or_default())?;
                        encoder.encode_field(&DayPeriod::of(slot.span.start).as_str().to_string())?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
            Command::SelectReservations {
                coach_id,
                from,
                to,
                include_cancelled,
                status,
            } => {
                let query = ScheduleQuery {
                    include_cancelled,
                    status,
                    ..ScheduleQuery::new(coach_id, from, to)
                };
                let list = engine.list_reservations(&query).await.map_err(engine_err)?;
                let schema = Arc::new(reservations_schema());
                let rows: Vec<PgWireResult<_>> = list
                    .into_iter()
                    .map(|r| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&r.id.to_string())?;
                        encoder.encode_field(&r.coach_id.to_string())?;
                        encoder.encode_field(&r.user_id.to_string())?;
                        encoder.encode_field(&r.user_ticket_id.to_string())?;
                        encoder.encode_field(&r.date.to_string())?;
                        encoder.encode_field(&format_hhmm(r.span.start))?;
                        encoder.encode_field(&format_hhmm(r.span.end))?;
                        encoder.encode_field(&r.status.as_str().to_string())?;
                        encoder.encode_field(&r.memo.unwrap_or_default())?;
                        encoder.encode_field(&r.status_reason.unwrap_or_default())?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
            Command::SelectWeeklyHours { coach_id, day } => {
                let hours = engine
                    .get_weekly_hours(coach_id, day)
                    .await
                    .map_err(engine_err)?;
                let schema = Arc::new(weekly_hours_schema());
                let rows: Vec<PgWireResult<_>> = hours
                    .into_iter()
                    .map(|h| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&h.coach_id.to_string())?;
                        encoder.encode_field(&(h.day.number() as i32))?;
                        encoder.encode_field(&format_hhmm(h.interval.span.start))?;
                        encoder.encode_field(&format_hhmm(h.interval.span.end))?;
                        encoder.encode_field(&h.interval.available)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
            Command::SelectTickets {
                user_id,
                active_only,
            } => {
                let tickets = engine.member_tickets(user_id, active_only).await;
                let schema = Arc::new(tickets_schema());
                let rows: Vec<PgWireResult<_>> = tickets
                    .into_iter()
                    .map(|t| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&t.id.to_string())?;
                        encoder.encode_field(&t.user_id.to_string())?;
                        encoder.encode_field(&(t.remaining_count as i64))?;
                        encoder.encode_field(&t.expires_at.to_string())?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
            Command::SelectCoaches => {
                let coaches = engine.list_coaches().await;
                let schema = Arc::new(coaches_schema());
                let rows: Vec<PgWireResult<_>> = coaches
                    .into_iter()
                    .map(|c| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&c.id.to_string())?;
                        encoder.encode_field(&c.name.unwrap_or_default())?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
        }
    }
}

// ── Result schemas ───────────────────────────────────────────────

fn text_field(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text)
}

fn slots_schema() -> Vec<FieldInfo> {
    vec![
        text_field("start_time"),
        text_field("end_time"),
        text_field("status"),
        text_field("duration_label"),
        text_field("period"),
    ]
}

fn reservations_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id"),
        text_field("coach_id"),
        text_field("user_id"),
        text_field("user_ticket_id"),
        text_field("date"),
        text_field("start_time"),
        text_field("end_time"),
        text_field("status"),
        text_field("memo"),
        text_field("status_reason"),
    ]
}

fn weekly_hours_schema() -> Vec<FieldInfo> {
    vec![
        text_field("coach_id"),
        FieldInfo::new("day_of_week".into(), None, None, Type::INT4, FieldFormat::Text),
        text_field("start_time"),
        text_field("end_time"),
        FieldInfo::new("available".into(), None, None, Type::BOOL, FieldFormat::Text),
    ]
}

fn tickets_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id"),
        text_field("user_id"),
        FieldInfo::new("remaining_count".into(), None, None, Type::INT8, FieldFormat::Text),
        text_field("expires_at"),
    ]
}

fn coaches_schema() -> Vec<FieldInfo> {
    vec![text_field("id"), text_field("name")]
}

/// Result columns of a statement, judged from the table after FROM. Works on
/// unbound statements whose `$N` placeholders would not parse.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    let mut words = sql.split_whitespace();
    let is_select = words
        .next()
        .is_some_and(|w| w.eq_ignore_ascii_case("SELECT"));
    if !is_select {
        return vec![];
    }
    let table = words
        .skip_while(|w| !w.eq_ignore_ascii_case("FROM"))
        .nth(1)
        .map(|t| t.trim_end_matches(';').to_lowercase());
    match table.as_deref() {
        Some("slots") => slots_schema(),
        Some("reservations") => reservations_schema(),
        Some("weekly_hours") => weekly_hours_schema(),
        Some("tickets") => tickets_schema(),
        Some("coaches") => coaches_schema(),
        _ => vec![],
    }
}

#[async_trait]
impl SimpleQueryHandler for CourtbookHandler {
    async fn do_query<C>(
        &self,
        client: &mut C,
        query: &str,
    ) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let engine = self.resolve_engine(client)?;
        Ok(vec![self.run(&engine, query).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct CourtbookQueryParser;

#[async_trait]
impl QueryParser for CourtbookQueryParser {
    type Statement = String;

    async fn parse_sql<C>(
        &self,
        _client: &C,
        sql: &str,
        _types: &[Option<Type>],
    ) -> PgWireResult<String>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        Ok(sql.to_string())
    }

    fn get_parameter_types(&self, stmt: &String) -> PgWireResult<Vec<Type>> {
        Ok(vec![Type::VARCHAR; count_params(stmt)])
    }

    fn get_result_schema(
        &self,
        stmt: &String,
        _column_format: Option<&Format>,
    ) -> PgWireResult<Vec<FieldInfo>> {
        Ok(result_schema(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for CourtbookHandler {
    type Statement = String;
    type QueryParser = CourtbookQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        client: &mut C,
        portal: &Portal<Self::Statement>,
        _max_rows: usize,
    ) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let engine = self.resolve_engine(client)?;
        let sql = substitute_params(portal);
        self.run(&engine, &sql).await
    }

    async fn do_describe_statement<C>(
        &self,
        _client: &mut C,
        target: &StoredStatement<Self::Statement>,
    ) -> PgWireResult<DescribeStatementResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let param_types = vec![Type::VARCHAR; count_params(&target.statement)];
        Ok(DescribeStatementResponse::new(
            param_types,
            result_schema(&target.statement),
        ))
    }

    async fn do_describe_portal<C>(
        &self,
        _client: &mut C,
        target: &Portal<Self::Statement>,
    ) -> PgWireResult<DescribePortalResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(DescribePortalResponse::new(result_schema(
            &target.statement.statement,
        )))
    }
}

/// Highest `$N` placeholder in the statement.
fn count_params(sql: &str) -> usize {
    let bytes = sql.as_bytes();
    let mut max = 0usize;
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'$' {
            i += 1;
            continue;
        }
        i += 1;
        let start = i;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
        if let Ok(n) = sql[start..i].parse::<usize>() {
            max = max.max(n);
        }
    }
    max
}

/// Inline bound text parameters as quoted literals.
fn substitute_params(portal: &Portal<String>) -> String {
    bind_params(&portal.statement.statement, &portal.parameters)
}

/// One left-to-right pass over `sql`: each `$N` with a bound value becomes
/// that value, quoted. Inserted text is never scanned again, and `$N`
/// past the last parameter is kept as written.
fn bind_params<B: AsRef<[u8]>>(sql: &str, params: &[Option<B>]) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut rest = sql;
    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];
        let digits = after.bytes().take_while(u8::is_ascii_digit).count();
        let bound = after[..digits]
            .parse::<usize>()
            .ok()
            .and_then(|n| n.checked_sub(1))
            .and_then(|i| params.get(i));
        match bound {
            Some(Some(bytes)) => {
                let text = String::from_utf8_lossy(bytes.as_ref());
                out.push('\'');
                out.push_str(&text.replace('\'', "''"));
                out.push('\'');
            }
            Some(None) => out.push_str("NULL"),
            None => out.push_str(&rest[pos..pos + 1 + digits]),
        }
        rest = &after[digits..];
    }
    out.push_str(rest);
    out
}

// ── Factory ──────────────────────────────────────────────────────

pub struct CourtbookFactory {
    handler: Arc<CourtbookHandler>,
    auth_handler: Arc<
        CleartextPasswordAuthStartupHandler<CourtbookAuthSource, DefaultServerParameterProvider>,
    >,
    noop: Arc<NoopHandler>,
}

impl CourtbookFactory {
    pub fn new(facilities: Arc<FacilityManager>, password: String) -> Self {
        let auth_source = CourtbookAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(CourtbookHandler::new(facilities)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for CourtbookFactory {
    fn simple_query_handler(&self) -> Arc<impl SimpleQueryHandler> {
        self.handler.clone()
    }

    fn extended_query_handler(&self) -> Arc<impl ExtendedQueryHandler> {
        self.handler.clone()
    }

    fn startup_handler(&self) -> Arc<impl StartupHandler> {
        self.auth_handler.clone()
    }

    fn copy_handler(&self) -> Arc<impl CopyHandler> {
        self.noop.clone()
    }
}

/// Serve one client until it disconnects.
pub async fn process_connection(
    socket: TcpStream,
    facilities: Arc<FacilityManager>,
    password: String,
) -> io::Result<()> {
    let factory = CourtbookFactory::new(facilities, password);
    pgwire::tokio::process_socket(socket, None, factory).await
}

fn engine_err(e: crate::engine::EngineError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "P0001".into(),
        e.to_string(),
    )))
}

fn sql_err(e: crate::sql::SqlError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "42601".into(),
        e.to_string(),
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_highest_placeholder() {
        assert_eq!(count_params("SELECT * FROM slots"), 0);
        assert_eq!(
            count_params("SELECT * FROM slots WHERE coach_id = $1 AND date = $2"),
            2
        );
        assert_eq!(count_params("VALUES ($2, $10, $1)"), 10);
        assert_eq!(count_params("a $ b"), 0);
    }

    #[test]
    fn bound_values_are_not_rescanned() {
        let params = [Some("it's $1".as_bytes()), None];
        assert_eq!(
            bind_params("VALUES ($1, $2, $10)", &params),
            "VALUES ('it''s $1', NULL, $10)"
        );
        let many: Vec<Option<String>> = (1..=10).map(|n| Some(format!("v{n}"))).collect();
        assert_eq!(bind_params("$10 $1 $", &many), "'v10' 'v1' $");
    }

    #[test]
    fn schema_follows_from_table() {
        assert_eq!(result_schema("SELECT * FROM slots WHERE coach_id = $1").len(), 5);
        assert_eq!(result_schema("select * from reservations;").len(), 10);
        assert_eq!(result_schema("SELECT * FROM coaches").len(), 2);
        assert!(result_schema("INSERT INTO coaches (id) VALUES ($1)").is_empty());
        assert!(result_schema("SELECT * FROM nowhere").is_empty());
    }
}

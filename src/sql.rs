use chrono::NaiveDate;
use sqlparser::ast::{self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value, ValueWithSpan};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;

/// Parsed command from SQL input. Times stay as the client's `HH:MM` text;
/// the engine validates them.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertCoach {
        id: Ulid,
        name: Option<String>,
    },
    DeleteCoach {
        id: Ulid,
    },
    /// Replaces one weekday's template with these rows.
    InsertWeeklyHours {
        coach_id: Ulid,
        day: DayOfWeek,
        rows: Vec<HoursRow>,
    },
    /// `day = None` clears the whole week.
    DeleteWeeklyHours {
        coach_id: Ulid,
        day: Option<DayOfWeek>,
    },
    InsertTicket {
        id: Ulid,
        user_id: Ulid,
        remaining_count: u32,
        expires_at: NaiveDate,
    },
    InsertReservation {
        id: Ulid,
        coach_id: Ulid,
        user_id: Ulid,
        user_ticket_id: Ulid,
        date: NaiveDate,
        start_time: String,
        end_time: String,
        memo: Option<String>,
    },
    InsertStatusUpdate {
        reservation_id: Ulid,
        status: ReservationStatus,
        reason: Option<String>,
    },
    /// Cancels; reservations are never removed.
    DeleteReservation {
        id: Ulid,
    },
    SelectSlots {
        coach_id: Ulid,
        date: NaiveDate,
        lesson_minutes: Option<Min>,
    },
    SelectReservations {
        coach_id: Ulid,
        from: NaiveDate,
        to: NaiveDate,
        include_cancelled: bool,
        status: Option<ReservationStatus>,
    },
    SelectWeeklyHours {
        coach_id: Ulid,
        day: Option<DayOfWeek>,
    },
    SelectTickets {
        user_id: Ulid,
        active_only: bool,
    },
    SelectCoaches,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HoursRow {
    pub start_time: String,
    pub end_time: String,
    pub available: bool,
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let Some(stmt) = stmts.first() else {
        return Err(SqlError::Empty);
    };

    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let rows = extract_insert_rows(insert)?;
    if table == "weekly_hours" {
        return parse_weekly_hours_rows(&rows);
    }
    // Only the weekly template takes several rows; everything else is one
    // record per statement.
    let [values] = rows.as_slice() else {
        return Err(SqlError::Unsupported(format!(
            "multi-row INSERT into {table} ({} rows)",
            rows.len()
        )));
    };

    match table.as_str() {
        "coaches" => {
            if values.is_empty() {
                return Err(SqlError::WrongArity("coaches", 1, 0));
            }
            let name = match values.get(1) {
                Some(v) => parse_string_or_null(v)?,
                None => None,
            };
            Ok(Command::InsertCoach {
                id: parse_ulid(&values[0])?,
                name,
            })
        }
        "tickets" => {
            if values.len() < 4 {
                return Err(SqlError::WrongArity("tickets", 4, values.len()));
            }
            Ok(Command::InsertTicket {
                id: parse_ulid(&values[0])?,
                user_id: parse_ulid(&values[1])?,
                remaining_count: parse_u32(&values[2])?,
                expires_at: parse_date_expr(&values[3])?,
            })
        }
        "reservations" => {
            if values.len() < 7 {
                return Err(SqlError::WrongArity("reservations", 7, values.len()));
            }
            let memo = match values.get(7) {
                Some(v) => parse_string_or_null(v)?,
                None => None,
            };
            Ok(Command::InsertReservation {
                id: parse_ulid(&values[0])?,
                coach_id: parse_ulid(&values[1])?,
                user_id: parse_ulid(&values[2])?,
                user_ticket_id: parse_ulid(&values[3])?,
                date: parse_date_expr(&values[4])?,
                start_time: parse_string(&values[5])?,
                end_time: parse_string(&values[6])?,
                memo,
            })
        }
        "status_updates" => {
            if values.len() < 2 {
                return Err(SqlError::WrongArity("status_updates", 2, values.len()));
            }
            let reason = match values.get(2) {
                Some(v) => parse_string_or_null(v)?,
                None => None,
            };
            Ok(Command::InsertStatusUpdate {
                reservation_id: parse_ulid(&values[0])?,
                status: parse_status(&values[1])?,
                reason,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Every row must name the same coach and weekday.
fn parse_weekly_hours_rows(rows: &[Vec<Expr>]) -> Result<Command, SqlError> {
    let mut target: Option<(Ulid, DayOfWeek)> = None;
    let mut out = Vec::with_capacity(rows.len());
    for (i, row) in rows.iter().enumerate() {
        if row.len() < 4 {
            return Err(SqlError::WrongArity("weekly_hours", 4, row.len()));
        }
        let coach_id = parse_ulid(&row[0]).map_err(|e| SqlError::Parse(format!("row {i}: {e}")))?;
        let day = parse_day(&row[1]).map_err(|e| SqlError::Parse(format!("row {i}: {e}")))?;
        match target {
            None => target = Some((coach_id, day)),
            Some(t) if t != (coach_id, day) => {
                return Err(SqlError::Parse(
                    "weekly_hours rows must share coach_id and day_of_week".into(),
                ));
            }
            Some(_) => {}
        }
        let available = match row.get(4) {
            Some(v) => parse_bool(v)?,
            None => true,
        };
        out.push(HoursRow {
            start_time: parse_string(&row[2])?,
            end_time: parse_string(&row[3])?,
            available,
        });
    }
    let (coach_id, day) = target.ok_or_else(|| SqlError::Parse("empty VALUES".into()))?;
    Ok(Command::InsertWeeklyHours {
        coach_id,
        day,
        rows: out,
    })
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;

    match table.as_str() {
        "coaches" => Ok(Command::DeleteCoach {
            id: extract_where_id(&delete.selection)?,
        }),
        "reservations" => Ok(Command::DeleteReservation {
            id: extract_where_id(&delete.selection)?,
        }),
        "weekly_hours" => {
            let mut filters = Filters::default();
            if let Some(selection) = &delete.selection {
                collect_filters(selection, &mut filters)?;
            }
            Ok(Command::DeleteWeeklyHours {
                coach_id: filters.coach_id.ok_or(SqlError::MissingFilter("coach_id"))?,
                day: filters.day,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    let Some(from) = select.from.first() else {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    };
    let table = table_factor_name(&from.relation)?;

    let mut filters = Filters::default();
    if let Some(selection) = &select.selection {
        collect_filters(selection, &mut filters)?;
    }

    match table.as_str() {
        "slots" => Ok(Command::SelectSlots {
            coach_id: filters.coach_id.ok_or(SqlError::MissingFilter("coach_id"))?,
            date: filters.date.ok_or(SqlError::MissingFilter("date"))?,
            lesson_minutes: filters.lesson_minutes,
        }),
        "reservations" => {
            let from = filters.from.or(filters.date).ok_or(SqlError::MissingFilter("date >="))?;
            let to = filters.to.or(filters.date).ok_or(SqlError::MissingFilter("date <="))?;
            Ok(Command::SelectReservations {
                coach_id: filters.coach_id.ok_or(SqlError::MissingFilter("coach_id"))?,
                from,
                to,
                include_cancelled: filters.include_cancelled.unwrap_or(false),
                status: filters.status,
            })
        }
        "weekly_hours" => Ok(Command::SelectWeeklyHours {
            coach_id: filters.coach_id.ok_or(SqlError::MissingFilter("coach_id"))?,
            day: filters.day,
        }),
        "tickets" => Ok(Command::SelectTickets {
            user_id: filters.user_id.ok_or(SqlError::MissingFilter("user_id"))?,
            active_only: filters.active.unwrap_or(false),
        }),
        "coaches" => Ok(Command::SelectCoaches),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// WHERE-clause values recognised across tables. Unknown columns are ignored.
#[derive(Debug, Default)]
struct Filters {
    coach_id: Option<Ulid>,
    user_id: Option<Ulid>,
    date: Option<NaiveDate>,
    from: Option<NaiveDate>,
    to: Option<NaiveDate>,
    day: Option<DayOfWeek>,
    lesson_minutes: Option<Min>,
    include_cancelled: Option<bool>,
    status: Option<ReservationStatus>,
    active: Option<bool>,
}

fn collect_filters(expr: &Expr, filters: &mut Filters) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => collect_filters(inner, filters)?,
        Expr::BinaryOp { left, op, right } => match op {
            ast::BinaryOperator::And => {
                collect_filters(left, filters)?;
                collect_filters(right, filters)?;
            }
            ast::BinaryOperator::Eq => match expr_column_name(left).as_deref() {
                Some("coach_id") => filters.coach_id = Some(parse_ulid(right)?),
                Some("user_id") => filters.user_id = Some(parse_ulid(right)?),
                Some("date") => filters.date = Some(parse_date_expr(right)?),
                Some("day_of_week") => filters.day = Some(parse_day(right)?),
                Some("lesson_minutes") => {
                    let v = parse_i64(right)?;
                    let minutes = Min::try_from(v)
                        .map_err(|_| SqlError::Parse(format!("{v} out of range for lesson_minutes")))?;
                    filters.lesson_minutes = Some(minutes);
                }
                Some("include_cancelled") => filters.include_cancelled = Some(parse_bool(right)?),
                Some("status") => filters.status = Some(parse_status(right)?),
                Some("active") => filters.active = Some(parse_bool(right)?),
                _ => {}
            },
            ast::BinaryOperator::GtEq => {
                if expr_column_name(left).as_deref() == Some("date") {
                    filters.from = Some(parse_date_expr(right)?);
                }
            }
            ast::BinaryOperator::LtEq => {
                if expr_column_name(left).as_deref() == Some("date") {
                    filters.to = Some(parse_date_expr(right)?);
                }
            }
            _ => {}
        },
        Expr::Between { expr, negated: false, low, high } => {
            if expr_column_name(expr).as_deref() == Some("date") {
                filters.from = Some(parse_date_expr(low)?);
                filters.to = Some(parse_date_expr(high)?);
            }
        }
        _ => {}
    }
    Ok(())
}

// ── Helpers ───────────────────────────────────────────────────

fn object_name_last(name: &ast::ObjectName) -> Option<String> {
    name.0.last().and_then(|part| match part {
        ObjectNamePart::Identifier(ident) => Some(ident.value.to_lowercase()),
        _ => None,
    })
}

fn insert_table_name(insert: &ast::Insert) -> Result<String, SqlError> {
    match &insert.table {
        TableObject::TableName(name) => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("unsupported table object in INSERT".into())),
    }
}

fn delete_table_name(delete: &ast::Delete) -> Result<String, SqlError> {
    let tables_with_joins = match &delete.from {
        FromTable::WithFromKeyword(t) | FromTable::WithoutKeyword(t) => t,
    };
    match tables_with_joins.first() {
        Some(first) => table_factor_name(&first.relation),
        None => Err(SqlError::Parse("DELETE without table".into())),
    }
}

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

/// All VALUES rows. Never empty on success.
fn extract_insert_rows(insert: &ast::Insert) -> Result<Vec<Vec<Expr>>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => {
            if values.rows.is_empty() {
                return Err(SqlError::Parse("empty VALUES".into()));
            }
            Ok(values.rows.clone())
        }
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    let sel = selection.as_ref().ok_or(SqlError::MissingFilter("id"))?;
    match sel {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } if expr_column_name(left).as_deref() == Some("id") => parse_ulid(right),
        _ => Err(SqlError::MissingFilter("id")),
    }
}

fn expr_column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.to_lowercase()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|i| i.value.to_lowercase()),
        _ => None,
    }
}

fn extract_value(expr: &Expr) -> Option<&Value> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => Some(value),
        _ => None,
    }
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        _ => parse_string(expr).map(Some),
    }
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) | Some(Value::Number(s, _)) => {
            Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
        }
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) | Value::SingleQuotedString(s) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad integer {s:?}: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value:?}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_i64(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u32 range")))
}

fn parse_bool(expr: &Expr) -> Result<bool, SqlError> {
    match extract_value(expr) {
        Some(Value::Boolean(b)) => Ok(*b),
        Some(Value::SingleQuotedString(s)) => match s.to_lowercase().as_str() {
            "true" | "t" | "1" => Ok(true),
            "false" | "f" | "0" => Ok(false),
            _ => Err(SqlError::Parse(format!("bad bool: {s}"))),
        },
        Some(Value::Number(n, _)) => Ok(n != "0"),
        Some(value) => Err(SqlError::Parse(format!("expected bool, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_date_expr(expr: &Expr) -> Result<NaiveDate, SqlError> {
    let s = parse_string(expr)?;
    parse_date(&s).ok_or_else(|| SqlError::Parse(format!("bad date {s:?}, expected YYYY-MM-DD")))
}

fn parse_day(expr: &Expr) -> Result<DayOfWeek, SqlError> {
    let v = parse_i64(expr)?;
    u8::try_from(v)
        .ok()
        .and_then(DayOfWeek::new)
        .ok_or_else(|| SqlError::Parse(format!("day_of_week {v} not in 0..=6")))
}

fn parse_status(expr: &Expr) -> Result<ReservationStatus, SqlError> {
    let s = parse_string(expr)?;
    ReservationStatus::parse(&s).ok_or_else(|| SqlError::Parse(format!("unknown status {s:?}")))
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum SqlError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("empty query")]
    Empty,
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("unknown table: {0}")]
    UnknownTable(String),
    #[error("{0}: expected {1} values, got {2}")]
    WrongArity(&'static str, usize, usize),
    #[error("missing filter: {0}")]
    MissingFilter(&'static str),
}

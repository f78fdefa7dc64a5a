use chrono::NaiveDate;
use sqlparser::ast::{
    self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value,
    ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertVenue {
        id: Ulid,
        name: Option<String>,
        policy: LocationPolicy,
    },
    UpdateVenue {
        id: Ulid,
        name: Option<String>,
        default_duration: Option<Min>,
        buffer: Option<Min>,
        auto_accept: Option<bool>,
        allow_unassigned: Option<bool>,
    },
    InsertShift {
        id: Ulid,
        venue_id: Ulid,
        start: Min,
        end: Min,
        weekdays: u8,
    },
    UpdateShift {
        id: Ulid,
        start: Option<Min>,
        end: Option<Min>,
        weekdays: Option<u8>,
        active: Option<bool>,
    },
    DeleteShift {
        id: Ulid,
    },
    InsertResource {
        id: Ulid,
        venue_id: Ulid,
        name: Option<String>,
        capacity: u32,
        combinable: bool,
    },
    UpdateResource {
        id: Ulid,
        name: Option<String>,
        capacity: Option<u32>,
        combinable: Option<bool>,
        active: Option<bool>,
    },
    DeleteResource {
        id: Ulid,
    },
    InsertBooking {
        request: BookingRequest,
        returning: bool,
    },
    UpdateBookingStatus {
        id: Ulid,
        status: BookingStatus,
        returning: bool,
    },
    AssignBooking {
        id: Ulid,
        resource_id: Ulid,
        returning: bool,
    },
    SelectAvailability {
        venue_id: Ulid,
        date: NaiveDate,
        party_size: u32,
    },
    SelectBookings {
        filter: BookingFilter,
    },
    SelectResources {
        venue_id: Ulid,
    },
    SelectShifts {
        venue_id: Ulid,
    },
    SelectVenues,
    Listen {
        channel: String,
    },
}

#[derive(Debug, PartialEq)]
pub enum BookingFilter {
    ById(Ulid),
    ByVenue(Ulid, Option<NaiveDate>),
    ByResource(Ulid, Option<NaiveDate>),
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let trimmed = sql.trim();
    if trimmed.to_uppercase().starts_with("LISTEN ") {
        let channel = trimmed[7..].trim().trim_matches(';').to_string();
        return Ok(Command::Listen { channel });
    }

    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }

    match &stmts[0] {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        Statement::Update {
            table,
            assignments,
            selection,
            returning,
            ..
        } => parse_update(table, assignments, selection, returning.is_some()),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

// ── INSERT ────────────────────────────────────────────────────

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let values = extract_insert_values(insert)?;
    let returning = insert.returning.is_some();

    match table.as_str() {
        "venues" => {
            if values.is_empty() {
                return Err(SqlError::WrongArity("venues", 1, 0));
            }
            let id = parse_ulid(&values[0])?;
            let name = if values.len() >= 2 {
                parse_string_or_null(&values[1])?
            } else {
                None
            };
            let defaults = LocationPolicy::default();
            let policy = LocationPolicy {
                default_duration_min: if values.len() >= 3 {
                    parse_i64(&values[2])?
                } else {
                    defaults.default_duration_min
                },
                buffer_min: if values.len() >= 4 {
                    parse_i64(&values[3])?
                } else {
                    defaults.buffer_min
                },
                auto_accept: if values.len() >= 5 {
                    parse_bool(&values[4])?
                } else {
                    defaults.auto_accept
                },
                allow_unassigned: if values.len() >= 6 {
                    parse_bool(&values[5])?
                } else {
                    defaults.allow_unassigned
                },
            };
            Ok(Command::InsertVenue { id, name, policy })
        }
        "shifts" => {
            if values.len() < 5 {
                return Err(SqlError::WrongArity("shifts", 5, values.len()));
            }
            Ok(Command::InsertShift {
                id: parse_ulid(&values[0])?,
                venue_id: parse_ulid(&values[1])?,
                start: parse_time(&values[2])?,
                end: parse_time(&values[3])?,
                weekdays: parse_weekdays(&values[4])?,
            })
        }
        "resources" => {
            if values.len() < 2 {
                return Err(SqlError::WrongArity("resources", 2, values.len()));
            }
            let id = parse_ulid(&values[0])?;
            let venue_id = parse_ulid(&values[1])?;
            let name = if values.len() >= 3 {
                parse_string_or_null(&values[2])?
            } else {
                None
            };
            let capacity = if values.len() >= 4 {
                parse_u32(&values[3])?
            } else {
                1
            };
            let combinable = if values.len() >= 5 {
                parse_bool(&values[4])?
            } else {
                false
            };
            Ok(Command::InsertResource {
                id,
                venue_id,
                name,
                capacity,
                combinable,
            })
        }
        "bookings" => {
            if values.len() < 7 {
                return Err(SqlError::WrongArity("bookings", 7, values.len()));
            }
            let resource_id = if values.len() >= 8 {
                parse_ulid_or_null(&values[7])?
            } else {
                None
            };
            let request = BookingRequest {
                idempotency_key: parse_string(&values[0])?,
                venue_id: parse_ulid(&values[1])?,
                date: parse_date(&values[2])?,
                start_min: parse_time(&values[3])?,
                end_min: parse_time(&values[4])?,
                party_size: parse_u32(&values[5])?,
                contact: parse_contact(&values[6])?,
                resource_id,
            };
            Ok(Command::InsertBooking { request, returning })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── UPDATE ────────────────────────────────────────────────────

fn parse_update(
    table: &ast::TableWithJoins,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
    returning: bool,
) -> Result<Command, SqlError> {
    let table = table_factor_name(&table.relation)?;
    let id = extract_where_id(selection)?;

    let mut sets: Vec<(String, &Expr)> = Vec::with_capacity(assignments.len());
    for assignment in assignments {
        let col = assignment_column(assignment)?;
        sets.push((col, &assignment.value));
    }

    match table.as_str() {
        "venues" => {
            let (mut name, mut default_duration, mut buffer) = (None, None, None);
            let (mut auto_accept, mut allow_unassigned) = (None, None);
            for (col, value) in sets {
                match col.as_str() {
                    "name" => name = Some(parse_string(value)?),
                    "default_duration" => default_duration = Some(parse_i64(value)?),
                    "buffer" => buffer = Some(parse_i64(value)?),
                    "auto_accept" => auto_accept = Some(parse_bool(value)?),
                    "allow_unassigned" => allow_unassigned = Some(parse_bool(value)?),
                    _ => return Err(SqlError::UnknownColumn("venues", col)),
                }
            }
            Ok(Command::UpdateVenue {
                id,
                name,
                default_duration,
                buffer,
                auto_accept,
                allow_unassigned,
            })
        }
        "shifts" => {
            let (mut start, mut end, mut weekdays, mut active) = (None, None, None, None);
            for (col, value) in sets {
                match col.as_str() {
                    "start" => start = Some(parse_time(value)?),
                    "end" => end = Some(parse_time(value)?),
                    "weekdays" => weekdays = Some(parse_weekdays(value)?),
                    "active" => active = Some(parse_bool(value)?),
                    _ => return Err(SqlError::UnknownColumn("shifts", col)),
                }
            }
            Ok(Command::UpdateShift {
                id,
                start,
                end,
                weekdays,
                active,
            })
        }
        "resources" => {
            let (mut name, mut capacity, mut combinable, mut active) = (None, None, None, None);
            for (col, value) in sets {
                match col.as_str() {
                    "name" => name = Some(parse_string(value)?),
                    "capacity" => capacity = Some(parse_u32(value)?),
                    "combinable" => combinable = Some(parse_bool(value)?),
                    "active" => active = Some(parse_bool(value)?),
                    _ => return Err(SqlError::UnknownColumn("resources", col)),
                }
            }
            Ok(Command::UpdateResource {
                id,
                name,
                capacity,
                combinable,
                active,
            })
        }
        "bookings" => {
            // Exactly one of `status` / `resource_id` may be set; the ledger
            // has no other mutable columns.
            if sets.len() != 1 {
                return Err(SqlError::Unsupported(
                    "bookings updates set exactly one of status or resource_id".into(),
                ));
            }
            let (col, value) = &sets[0];
            match col.as_str() {
                "status" => Ok(Command::UpdateBookingStatus {
                    id,
                    status: parse_status(value)?,
                    returning,
                }),
                "resource_id" => Ok(Command::AssignBooking {
                    id,
                    resource_id: parse_ulid(value)?,
                    returning,
                }),
                other => Err(SqlError::UnknownColumn("bookings", other.to_string())),
            }
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── DELETE ────────────────────────────────────────────────────

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;

    match table.as_str() {
        "shifts" => Ok(Command::DeleteShift {
            id: extract_where_id(&delete.selection)?,
        }),
        "resources" => Ok(Command::DeleteResource {
            id: extract_where_id(&delete.selection)?,
        }),
        "bookings" => Err(SqlError::Unsupported(
            "bookings are cancelled via status, not deleted".into(),
        )),
        "venues" => Err(SqlError::Unsupported("venues cannot be deleted".into())),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── SELECT ────────────────────────────────────────────────────

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    if select.from.is_empty() {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    }
    let table = table_factor_name(&select.from[0].relation)?;

    let mut filters: Vec<(String, &Expr)> = Vec::new();
    if let Some(selection) = &select.selection {
        collect_eq_filters(selection, &mut filters)?;
    }
    let find = |col: &str| filters.iter().find(|(c, _)| c == col).map(|(_, e)| *e);

    match table.as_str() {
        "availability" => Ok(Command::SelectAvailability {
            venue_id: parse_ulid(find("venue_id").ok_or(SqlError::MissingFilter("venue_id"))?)?,
            date: parse_date(find("date").ok_or(SqlError::MissingFilter("date"))?)?,
            party_size: parse_u32(
                find("party_size").ok_or(SqlError::MissingFilter("party_size"))?,
            )?,
        }),
        "bookings" => {
            let date = find("date").map(parse_date).transpose()?;
            if let Some(id) = find("id") {
                Ok(Command::SelectBookings {
                    filter: BookingFilter::ById(parse_ulid(id)?),
                })
            } else if let Some(venue_id) = find("venue_id") {
                Ok(Command::SelectBookings {
                    filter: BookingFilter::ByVenue(parse_ulid(venue_id)?, date),
                })
            } else if let Some(resource_id) = find("resource_id") {
                Ok(Command::SelectBookings {
                    filter: BookingFilter::ByResource(parse_ulid(resource_id)?, date),
                })
            } else {
                Err(SqlError::MissingFilter("id, venue_id or resource_id"))
            }
        }
        "resources" => Ok(Command::SelectResources {
            venue_id: parse_ulid(find("venue_id").ok_or(SqlError::MissingFilter("venue_id"))?)?,
        }),
        "shifts" => Ok(Command::SelectShifts {
            venue_id: parse_ulid(find("venue_id").ok_or(SqlError::MissingFilter("venue_id"))?)?,
        }),
        "venues" => Ok(Command::SelectVenues),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Walk AND-joined equality comparisons into (column, value-expr) pairs.
fn collect_eq_filters<'a>(
    expr: &'a Expr,
    out: &mut Vec<(String, &'a Expr)>,
) -> Result<(), SqlError> {
    match expr {
        Expr::BinaryOp { left, op, right } => match op {
            ast::BinaryOperator::And => {
                collect_eq_filters(left, out)?;
                collect_eq_filters(right, out)?;
            }
            ast::BinaryOperator::Eq => {
                if let Some(col) = expr_column_name(left) {
                    out.push((col, right));
                }
            }
            _ => return Err(SqlError::Unsupported("only = and AND filters".into())),
        },
        Expr::Nested(inner) => collect_eq_filters(inner, out)?,
        _ => return Err(SqlError::Unsupported("only = and AND filters".into())),
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
    if let Some(first) = tables_with_joins.first() {
        table_factor_name(&first.relation)
    } else {
        Err(SqlError::Parse("DELETE without table".into()))
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

fn extract_insert_values(insert: &ast::Insert) -> Result<Vec<Expr>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => {
            if values.rows.is_empty() {
                return Err(SqlError::Parse("empty VALUES".into()));
            }
            if values.rows.len() > 1 {
                return Err(SqlError::Unsupported("multi-row INSERT".into()));
            }
            Ok(values.rows[0].clone())
        }
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn assignment_column(assignment: &ast::Assignment) -> Result<String, SqlError> {
    match &assignment.target {
        ast::AssignmentTarget::ColumnName(name) => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty column name".into()))
        }
        _ => Err(SqlError::Parse("unsupported SET target".into())),
    }
}

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    let sel = selection.as_ref().ok_or(SqlError::MissingFilter("id"))?;
    match sel {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } => {
            if expr_column_name(left).as_deref() == Some("id") {
                parse_ulid(right)
            } else {
                Err(SqlError::MissingFilter("id"))
            }
        }
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

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::SingleQuotedString(s) | Value::Number(s, _) => {
                Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
            }
            _ => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_ulid_or_null(expr: &Expr) -> Result<Option<Ulid>, SqlError> {
    if let Some(Value::Null) = extract_value(expr) {
        return Ok(None);
    }
    parse_ulid(expr).map(Some)
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::SingleQuotedString(s) => Ok(s.clone()),
            _ => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    if let Some(Value::Null) = extract_value(expr) {
        return Ok(None);
    }
    parse_string(expr).map(Some)
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad i64: {e}"))),
            Value::SingleQuotedString(s) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad i64: {e}"))),
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
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Boolean(b) => Ok(*b),
            Value::SingleQuotedString(s) => match s.to_lowercase().as_str() {
                "true" | "t" | "1" => Ok(true),
                "false" | "f" | "0" => Ok(false),
                _ => Err(SqlError::Parse(format!("bad bool: {s}"))),
            },
            Value::Number(n, _) => Ok(n != "0"),
            _ => Err(SqlError::Parse(format!("expected bool, got {value:?}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

/// 'YYYY-MM-DD'.
fn parse_date(expr: &Expr) -> Result<NaiveDate, SqlError> {
    let s = parse_string(expr)?;
    NaiveDate::parse_from_str(&s, "%Y-%m-%d").map_err(|e| SqlError::Parse(format!("bad date: {e}")))
}

/// Minute-of-day, as 'HH:MM' or a bare integer.
fn parse_time(expr: &Expr) -> Result<Min, SqlError> {
    if let Some(Value::SingleQuotedString(s)) = extract_value(expr)
        && let Some((h, m)) = s.split_once(':')
    {
        let h: Min = h
            .parse()
            .map_err(|e| SqlError::Parse(format!("bad time: {e}")))?;
        let m: Min = m
            .parse()
            .map_err(|e| SqlError::Parse(format!("bad time: {e}")))?;
        if !(0..24).contains(&h) || !(0..60).contains(&m) {
            return Err(SqlError::Parse(format!("bad time: {s}")));
        }
        return Ok(h * 60 + m);
    }
    parse_i64(expr)
}

/// Weekday set, as a bitmask (bit 0 = Monday) or 'mon,tue,...'.
fn parse_weekdays(expr: &Expr) -> Result<u8, SqlError> {
    if let Some(Value::SingleQuotedString(s)) = extract_value(expr)
        && s.chars().any(|c| c.is_ascii_alphabetic())
    {
        let mut mask = 0u8;
        for day in s.split(',') {
            let bit = match day.trim().to_lowercase().as_str() {
                "mon" => 0,
                "tue" => 1,
                "wed" => 2,
                "thu" => 3,
                "fri" => 4,
                "sat" => 5,
                "sun" => 6,
                other => return Err(SqlError::Parse(format!("bad weekday: {other}"))),
            };
            mask |= 1 << bit;
        }
        return Ok(mask);
    }
    let v = parse_i64(expr)?;
    u8::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of weekday mask range")))
}

fn parse_status(expr: &Expr) -> Result<BookingStatus, SqlError> {
    let s = parse_string(expr)?;
    BookingStatus::parse(&s).ok_or_else(|| SqlError::Parse(format!("unknown status: {s}")))
}

/// Contact column: a JSON object ({"name": ..., "phone": ...}) or a bare
/// string taken as the guest name.
fn parse_contact(expr: &Expr) -> Result<Contact, SqlError> {
    let s = parse_string(expr)?;
    if s.len() > crate::limits::MAX_CONTACT_JSON_LEN {
        return Err(SqlError::Parse("contact too long".into()));
    }
    if s.trim_start().starts_with('{') {
        serde_json::from_str(&s).map_err(|e| SqlError::Parse(format!("bad contact JSON: {e}")))
    } else {
        Ok(Contact {
            name: s,
            ..Contact::default()
        })
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    UnknownColumn(&'static str, String),
    WrongArity(&'static str, usize, usize),
    MissingFilter(&'static str),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::UnknownColumn(t, c) => write!(f, "unknown column on {t}: {c}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}

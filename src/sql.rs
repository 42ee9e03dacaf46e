use chrono::{DateTime, NaiveDate, NaiveTime};
use sqlparser::ast::{
    self, AssignmentTarget, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value,
    ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::keywords::Keyword;
use sqlparser::parser::{Parser, ParserError};
use sqlparser::tokenizer::Token;
use thiserror::Error;
use ulid::Ulid;

use crate::limits::MAX_SQL_LEN;
use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertWorkspace {
        id: Ulid,
        name: String,
        timezone: String,
    },
    UpdateWorkspace {
        id: Ulid,
        patch: WorkspacePatch,
    },
    SelectWorkspace {
        id: Ulid,
    },
    InsertServiceType {
        id: Ulid,
        workspace_id: Ulid,
        name: String,
        duration_minutes: u32,
        location: Option<String>,
        description: Option<String>,
    },
    UpdateServiceType {
        id: Ulid,
        patch: ServiceTypePatch,
    },
    SelectServiceTypes {
        workspace_id: Ulid,
    },
    InsertRule {
        id: Ulid,
        service_type_id: Ulid,
        day_of_week: u8,
        start_time: NaiveTime,
        end_time: NaiveTime,
        resource: Option<String>,
    },
    DeleteRule {
        id: Ulid,
    },
    SelectRules {
        service_type_id: Ulid,
    },
    InsertBooking {
        id: Ulid,
        workspace_id: Ulid,
        service_type_id: Ulid,
        scheduled_at: Ms,
        contact: ContactInput,
        notes: Option<String>,
        status: Option<BookingStatus>,
    },
    UpdateBookingStatus {
        id: Ulid,
        status: BookingStatus,
    },
    SelectBooking {
        id: Ulid,
    },
    SelectBookings {
        workspace_id: Ulid,
        filter: BookingFilter,
    },
    SelectContact {
        id: Ulid,
    },
    SelectAvailability {
        workspace_id: Ulid,
        service_type_id: Ulid,
        date: NaiveDate,
    },
}

impl Command {
    /// Statements an unauthenticated intake session may run.
    pub fn is_public(&self) -> bool {
        matches!(
            self,
            Command::InsertBooking { .. } | Command::SelectAvailability { .. }
        )
    }
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    if sql.len() > MAX_SQL_LEN {
        return Err(SqlError::TooLong);
    }
    let trimmed = sql.trim();
    if trimmed.is_empty() || trimmed == ";" {
        return Err(SqlError::Empty);
    }
    if trimmed
        .get(..7)
        .is_some_and(|head| head.eq_ignore_ascii_case("update "))
    {
        return parse_update(trimmed);
    }

    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql)?;
    let Some(stmt) = stmts.first() else {
        return Err(SqlError::Empty);
    };
    if stmts.len() > 1 {
        return Err(SqlError::Unsupported("multiple statements".into()));
    }

    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

// ── INSERT ────────────────────────────────────────────────────

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let values = extract_insert_values(insert)?;

    match table.as_str() {
        "workspaces" => {
            arity("workspaces", &values, 2, 3)?;
            Ok(Command::InsertWorkspace {
                id: parse_ulid(&values[0])?,
                name: parse_text(&values[1])?,
                timezone: match values.get(2) {
                    Some(v) => parse_text_or_null(v)?.unwrap_or_else(|| "UTC".into()),
                    None => "UTC".into(),
                },
            })
        }
        "service_types" => {
            arity("service_types", &values, 4, 6)?;
            Ok(Command::InsertServiceType {
                id: parse_ulid(&values[0])?,
                workspace_id: parse_ulid(&values[1])?,
                name: parse_text(&values[2])?,
                duration_minutes: parse_u32(&values[3])?,
                location: optional(&values, 4, parse_text_or_null)?,
                description: optional(&values, 5, parse_text_or_null)?,
            })
        }
        "availability_rules" => {
            arity("availability_rules", &values, 5, 6)?;
            let day = parse_i64(&values[2])?;
            Ok(Command::InsertRule {
                id: parse_ulid(&values[0])?,
                service_type_id: parse_ulid(&values[1])?,
                day_of_week: u8::try_from(day).map_err(|_| SqlError::Parse(format!("bad day_of_week: {day}")))?,
                start_time: parse_time(&values[3])?,
                end_time: parse_time(&values[4])?,
                resource: optional(&values, 5, parse_text_or_null)?,
            })
        }
        "bookings" => {
            arity("bookings", &values, 8, 9)?;
            Ok(Command::InsertBooking {
                id: parse_ulid_or_null(&values[0])?.unwrap_or_else(Ulid::new),
                workspace_id: parse_ulid(&values[1])?,
                service_type_id: parse_ulid(&values[2])?,
                scheduled_at: parse_timestamp(&values[3])?,
                contact: ContactInput {
                    name: parse_text(&values[4])?,
                    email: parse_text(&values[5])?,
                    phone: parse_text_or_null(&values[6])?,
                },
                notes: parse_text_or_null(&values[7])?,
                status: optional(&values, 8, |e| parse_text_or_null(e)?.map(|s| parse_status(&s)).transpose())?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn arity(table: &'static str, values: &[Expr], min: usize, max: usize) -> Result<(), SqlError> {
    if values.len() < min || values.len() > max {
        return Err(SqlError::WrongArity(table, min, values.len()));
    }
    Ok(())
}

/// Parse position `idx` if present; a missing trailing value reads as `None`.
fn optional<T>(
    values: &[Expr],
    idx: usize,
    parse: impl Fn(&Expr) -> Result<Option<T>, SqlError>,
) -> Result<Option<T>, SqlError> {
    values.get(idx).map_or(Ok(None), parse)
}

// ── DELETE ────────────────────────────────────────────────────

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "availability_rules" => Ok(Command::DeleteRule { id }),
        "bookings" => Err(SqlError::Unsupported(
            "bookings are never deleted; set status to 'cancelled'".into(),
        )),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── UPDATE ────────────────────────────────────────────────────

fn parse_update(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let mut parser = Parser::new(&dialect).try_with_sql(sql)?;
    parser.expect_keyword(Keyword::UPDATE)?;
    let table = object_name_last(&parser.parse_object_name(false)?)
        .ok_or_else(|| SqlError::Parse("empty table name".into()))?;
    parser.expect_keyword(Keyword::SET)?;
    let assignments = parser.parse_comma_separated(Parser::parse_assignment)?;
    let selection = if parser.parse_keyword(Keyword::WHERE) {
        Some(parser.parse_expr()?)
    } else {
        None
    };
    while parser.consume_token(&Token::SemiColon) {}
    if parser.peek_token().token != Token::EOF {
        return Err(SqlError::Unsupported("trailing input after UPDATE".into()));
    }
    let id = extract_where_id(&selection)?;

    let mut sets = Vec::with_capacity(assignments.len());
    for assignment in &assignments {
        let column = match &assignment.target {
            AssignmentTarget::ColumnName(name) => object_name_last(name),
            AssignmentTarget::Tuple(_) => None,
        }
        .ok_or_else(|| SqlError::Unsupported("tuple assignment".into()))?;
        sets.push((column, &assignment.value));
    }

    match table.as_str() {
        "workspaces" => {
            let mut patch = WorkspacePatch::default();
            for (column, value) in sets {
                match column.as_str() {
                    "name" => patch.name = Some(parse_text(value)?),
                    "timezone" => patch.timezone = Some(parse_text(value)?),
                    "active" => patch.active = Some(parse_bool(value)?),
                    _ => return Err(SqlError::UnknownColumn("workspaces", column)),
                }
            }
            Ok(Command::UpdateWorkspace { id, patch })
        }
        "service_types" => {
            let mut patch = ServiceTypePatch::default();
            for (column, value) in sets {
                match column.as_str() {
                    "name" => patch.name = Some(parse_text(value)?),
                    "description" => patch.description = Some(parse_text_or_null(value)?),
                    "location" => patch.location = Some(parse_text_or_null(value)?),
                    "duration_minutes" => patch.duration_minutes = Some(parse_u32(value)?),
                    "active" => patch.active = Some(parse_bool(value)?),
                    _ => return Err(SqlError::UnknownColumn("service_types", column)),
                }
            }
            Ok(Command::UpdateServiceType { id, patch })
        }
        "bookings" => match sets.as_slice() {
            [(column, value)] if column == "status" => Ok(Command::UpdateBookingStatus {
                id,
                status: parse_status(&parse_text(value)?)?,
            }),
            _ => Err(SqlError::Unsupported("only status can be updated on bookings".into())),
        },
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── SELECT ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cmp {
    Eq,
    GtEq,
    LtEq,
}

/// One `column <op> value` term of an AND-only WHERE clause.
struct Condition<'a> {
    column: String,
    cmp: Cmp,
    value: &'a Expr,
}

fn collect_conditions<'a>(expr: &'a Expr, out: &mut Vec<Condition<'a>>) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => collect_conditions(inner, out),
        Expr::BinaryOp { left, op, right } => {
            let cmp = match op {
                ast::BinaryOperator::And => {
                    collect_conditions(left, out)?;
                    return collect_conditions(right, out);
                }
                ast::BinaryOperator::Eq => Cmp::Eq,
                ast::BinaryOperator::GtEq => Cmp::GtEq,
                ast::BinaryOperator::LtEq => Cmp::LtEq,
                other => return Err(SqlError::Unsupported(format!("operator {other}"))),
            };
            let column = expr_column_name(left)
                .ok_or_else(|| SqlError::Unsupported(format!("left operand {left}")))?;
            out.push(Condition { column, cmp, value: right });
            Ok(())
        }
        other => Err(SqlError::Unsupported(format!("WHERE {other}"))),
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

    let mut conditions = Vec::new();
    if let Some(selection) = &select.selection {
        collect_conditions(selection, &mut conditions)?;
    }
    let lookup = |column: &'static str| {
        conditions
            .iter()
            .find(|c| c.column == column && c.cmp == Cmp::Eq)
            .map(|c| c.value)
    };
    let required_ulid = |column: &'static str| {
        lookup(column)
            .ok_or(SqlError::MissingFilter(column))
            .and_then(parse_ulid)
    };

    match table.as_str() {
        "workspaces" => Ok(Command::SelectWorkspace { id: required_ulid("id")? }),
        "contacts" => Ok(Command::SelectContact { id: required_ulid("id")? }),
        "service_types" => Ok(Command::SelectServiceTypes {
            workspace_id: required_ulid("workspace_id")?,
        }),
        "availability_rules" => Ok(Command::SelectRules {
            service_type_id: required_ulid("service_type_id")?,
        }),
        "availability" => Ok(Command::SelectAvailability {
            workspace_id: required_ulid("workspace_id")?,
            service_type_id: required_ulid("service_type_id")?,
            date: parse_date(lookup("date").ok_or(SqlError::MissingFilter("date"))?)?,
        }),
        "bookings" => {
            let mut workspace_id = None;
            let mut filter = BookingFilter::default();
            for c in &conditions {
                match (c.column.as_str(), c.cmp) {
                    ("workspace_id", Cmp::Eq) => workspace_id = Some(parse_ulid(c.value)?),
                    ("id", Cmp::Eq) => filter.id = Some(parse_ulid(c.value)?),
                    ("status", Cmp::Eq) => filter.status = Some(parse_status(&parse_text(c.value)?)?),
                    ("scheduled_at", Cmp::GtEq) => filter.from = Some(parse_timestamp(c.value)?),
                    ("scheduled_at", Cmp::LtEq) => filter.to = Some(parse_timestamp(c.value)?),
                    _ => return Err(SqlError::UnknownColumn("bookings", c.column.clone())),
                }
            }
            match (workspace_id, filter.id) {
                (Some(workspace_id), _) => Ok(Command::SelectBookings { workspace_id, filter }),
                (None, Some(id)) if filter == (BookingFilter { id: Some(id), ..Default::default() }) => {
                    Ok(Command::SelectBooking { id })
                }
                _ => Err(SqlError::MissingFilter("workspace_id")),
            }
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
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

fn extract_insert_values(insert: &ast::Insert) -> Result<Vec<Expr>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or_else(|| SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [] => Err(SqlError::Parse("empty VALUES".into())),
            [row] => Ok(row.clone()),
            _ => Err(SqlError::Unsupported("multi-row VALUES".into())),
        },
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    match selection {
        Some(Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        }) if expr_column_name(left).as_deref() == Some("id") => parse_ulid(right),
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

fn is_null(expr: &Expr) -> bool {
    matches!(extract_value(expr), Some(Value::Null))
}

fn parse_text(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(other) => Err(SqlError::Parse(format!("expected string, got {other}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_text_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    if is_null(expr) {
        return Ok(None);
    }
    parse_text(expr).map(Some)
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => {
            Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID {s:?}: {e}")))
        }
        Some(other) => Err(SqlError::Parse(format!("expected ULID string, got {other}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_ulid_or_null(expr: &Expr) -> Result<Option<Ulid>, SqlError> {
    if is_null(expr) {
        return Ok(None);
    }
    parse_ulid(expr).map(Some)
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    match (extract_value(expr), expr) {
        (Some(Value::Number(s, _)), _) | (Some(Value::SingleQuotedString(s)), _) => s
            .trim()
            .parse()
            .map_err(|e| SqlError::Parse(format!("bad integer {s:?}: {e}"))),
        (
            None,
            Expr::UnaryOp {
                op: ast::UnaryOperator::Minus,
                expr,
            },
        ) => Ok(-parse_i64(expr)?),
        (Some(other), _) => Err(SqlError::Parse(format!("expected number, got {other}"))),
        (None, _) => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of range")))
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
        Some(other) => Err(SqlError::Parse(format!("expected bool, got {other}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_status(s: &str) -> Result<BookingStatus, SqlError> {
    BookingStatus::parse(s).ok_or_else(|| SqlError::Parse(format!("unknown status {s:?}")))
}

/// Integer Unix milliseconds, or an RFC 3339 string with an offset.
fn parse_timestamp(expr: &Expr) -> Result<Ms, SqlError> {
    if let Some(Value::SingleQuotedString(s)) = extract_value(expr)
        && s.trim().parse::<i64>().is_err()
    {
        return DateTime::parse_from_rfc3339(s.trim())
            .map(|dt| dt.timestamp_millis())
            .map_err(|e| SqlError::Parse(format!("bad timestamp {s:?}: {e}")));
    }
    parse_i64(expr)
}

fn parse_time(expr: &Expr) -> Result<NaiveTime, SqlError> {
    let s = parse_text(expr)?;
    NaiveTime::parse_from_str(&s, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(&s, "%H:%M:%S"))
        .map_err(|_| SqlError::Parse(format!("bad time {s:?}, expected HH:MM")))
}

fn parse_date(expr: &Expr) -> Result<NaiveDate, SqlError> {
    let s = parse_text(expr)?;
    NaiveDate::parse_from_str(&s, "%Y-%m-%d")
        .map_err(|_| SqlError::Parse(format!("bad date {s:?}, expected YYYY-MM-DD")))
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum SqlError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("empty query")]
    Empty,
    #[error("query too long")]
    TooLong,
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("unknown table: {0}")]
    UnknownTable(String),
    #[error("{0}: unknown column {1}")]
    UnknownColumn(&'static str, String),
    #[error("{0}: expected at least {1} values, got {2}")]
    WrongArity(&'static str, usize, usize),
    #[error("missing filter: {0}")]
    MissingFilter(&'static str),
}

impl From<ParserError> for SqlError {
    fn from(e: ParserError) -> Self {
        SqlError::Parse(e.to_string())
    }
}

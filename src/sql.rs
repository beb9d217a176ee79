use std::collections::BTreeMap;

use chrono::NaiveDate;
use sqlparser::ast::{self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value, ValueWithSpan};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::auth::{AUTH_TOKEN_KEY, BearerToken};
use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    SetAuthToken {
        token: BearerToken,
    },
    ResetAuthToken,
    InsertBooking {
        resource_id: String,
        user_id: String,
        owner_id: String,
        start: Ms,
        end: Ms,
    },
    DeleteBooking {
        id: Ulid,
    },
    SelectBookings {
        filter: BookingFilter,
    },
    SelectAvailability {
        resource_id: String,
        start: Ms,
        end: Ms,
    },
    SelectAvailabilityAt {
        resource_id: String,
        at: Ms,
    },
    SelectDailyAvailability {
        resource_id: String,
        date: NaiveDate,
    },
}

/// Which bookings a `SELECT ... FROM bookings` asks for.
#[derive(Debug, PartialEq)]
pub enum BookingFilter {
    All,
    Id(Ulid),
    User(String),
    Resource(String),
    ResourceDay { resource_id: String, date: NaiveDate },
}

/// Column order assumed by an INSERT without a column list.
const INSERT_COLUMNS: [&str; 5] = ["listing_id", "user_id", "owner_id", "start_time", "end_time"];

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    if let Some(cmd) = parse_session_command(sql)? {
        return Ok(cmd);
    }

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

// ── Session settings ──────────────────────────────────────────

/// `SET auth_token = '...'` / `SET auth_token TO '...'` / `RESET auth_token`.
/// Handled textually: the credential is opaque and never reaches sqlparser.
fn parse_session_command(sql: &str) -> Result<Option<Command>, SqlError> {
    let s = sql.trim().trim_end_matches(';').trim_end();

    if let Some(name) = strip_keyword(s, "RESET") {
        return if name.eq_ignore_ascii_case(AUTH_TOKEN_KEY) {
            Ok(Some(Command::ResetAuthToken))
        } else {
            Err(SqlError::Unsupported(format!("RESET {name}")))
        };
    }

    let Some(rest) = strip_keyword(s, "SET") else {
        return Ok(None);
    };
    let (name, value) = split_assignment(rest)
        .ok_or_else(|| SqlError::Parse("expected SET <name> = '<value>'".into()))?;
    if !name.eq_ignore_ascii_case(AUTH_TOKEN_KEY) {
        return Err(SqlError::Unsupported(format!("SET {name}")));
    }
    let value = unquote(value)
        .ok_or_else(|| SqlError::Parse("auth_token must be a single-quoted string".into()))?;
    let token = BearerToken::parse(&value).map_err(SqlError::InvalidValue)?;
    Ok(Some(Command::SetAuthToken { token }))
}

fn strip_keyword<'a>(s: &'a str, keyword: &str) -> Option<&'a str> {
    let head = s.get(..keyword.len())?;
    let rest = &s[keyword.len()..];
    (head.eq_ignore_ascii_case(keyword) && rest.starts_with(char::is_whitespace))
        .then(|| rest.trim_start())
}

fn split_assignment(s: &str) -> Option<(&str, &str)> {
    if let Some((name, value)) = s.split_once('=') {
        return Some((name.trim(), value.trim()));
    }
    let (name, tail) = s.split_once(char::is_whitespace)?;
    Some((name.trim(), strip_keyword(tail.trim_start(), "TO")?))
}

fn unquote(s: &str) -> Option<String> {
    let inner = s.strip_prefix('\'')?.strip_suffix('\'')?;
    Some(inner.replace("''", "'"))
}

// ── Statements ────────────────────────────────────────────────

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    if table != "bookings" {
        return Err(SqlError::UnknownTable(table));
    }

    let rows = extract_insert_rows(insert)?;
    if rows.len() != 1 {
        return Err(SqlError::Unsupported("multi-row INSERT into bookings".into()));
    }
    let values = &rows[0];

    let columns: Vec<String> = if insert.columns.is_empty() {
        INSERT_COLUMNS.iter().map(|c| c.to_string()).collect()
    } else {
        insert
            .columns
            .iter()
            .map(|c| canonical_column(&c.value))
            .collect()
    };
    if columns.len() != values.len() {
        return Err(SqlError::WrongArity("bookings", columns.len(), values.len()));
    }

    let mut fields = BTreeMap::new();
    for (column, value) in columns.into_iter().zip(values) {
        if !INSERT_COLUMNS.contains(&column.as_str()) {
            return Err(SqlError::UnknownColumn(column));
        }
        fields.insert(column, value);
    }
    let field = |name: &'static str| fields.get(name).copied().ok_or(SqlError::MissingColumn(name));

    Ok(Command::InsertBooking {
        resource_id: parse_string(field("listing_id")?)?,
        user_id: parse_string(field("user_id")?)?,
        owner_id: parse_string(field("owner_id")?)?,
        start: parse_timestamp(field("start_time")?)?,
        end: parse_timestamp(field("end_time")?)?,
    })
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    if table != "bookings" {
        return Err(SqlError::UnknownTable(table));
    }
    let id = extract_where_id(&delete.selection)?;
    Ok(Command::DeleteBooking { id })
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    if select.from.is_empty() {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    }
    let table = table_factor_name(&select.from[0].relation)?;

    let mut filters = BTreeMap::new();
    if let Some(selection) = &select.selection {
        collect_eq_filters(selection, &mut filters)?;
    }

    match table.as_str() {
        "bookings" => parse_booking_filter(filters),
        "availability" => {
            only_columns(&filters, &["listing_id", "start", "end", "at"])?;
            let resource_id = parse_string(required(&filters, "listing_id")?)?;
            match (filters.get("start"), filters.get("end"), filters.get("at")) {
                (Some(start), Some(end), None) => Ok(Command::SelectAvailability {
                    resource_id,
                    start: parse_timestamp(start)?,
                    end: parse_timestamp(end)?,
                }),
                (None, None, Some(at)) => Ok(Command::SelectAvailabilityAt {
                    resource_id,
                    at: parse_timestamp(at)?,
                }),
                _ => Err(SqlError::MissingFilter("start and \"end\", or at")),
            }
        }
        "daily_availability" => {
            only_columns(&filters, &["listing_id", "date"])?;
            Ok(Command::SelectDailyAvailability {
                resource_id: parse_string(required(&filters, "listing_id")?)?,
                date: parse_date_expr(required(&filters, "date")?)?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_booking_filter(filters: BTreeMap<String, &Expr>) -> Result<Command, SqlError> {
    only_columns(&filters, &["id", "user_id", "listing_id", "date"])?;
    let filter = match (
        filters.get("id"),
        filters.get("user_id"),
        filters.get("listing_id"),
        filters.get("date"),
    ) {
        (None, None, None, None) => BookingFilter::All,
        (Some(id), None, None, None) => BookingFilter::Id(parse_ulid(id)?),
        (None, Some(user), None, None) => BookingFilter::User(parse_string(user)?),
        (None, None, Some(listing), None) => BookingFilter::Resource(parse_string(listing)?),
        (None, None, Some(listing), Some(date)) => BookingFilter::ResourceDay {
            resource_id: parse_string(listing)?,
            date: parse_date_expr(date)?,
        },
        (None, None, None, Some(_)) => return Err(SqlError::MissingFilter("listing_id")),
        _ => {
            return Err(SqlError::Unsupported(
                "bookings filter must be one of: id, user_id, listing_id [AND date]".into(),
            ));
        }
    };
    Ok(Command::SelectBookings { filter })
}

/// Flatten `a = 'x' AND b = 'y'` into column → value.
fn collect_eq_filters<'a>(expr: &'a Expr, out: &mut BTreeMap<String, &'a Expr>) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => collect_eq_filters(inner, out),
        Expr::BinaryOp { left, op, right } => match op {
            ast::BinaryOperator::And => {
                collect_eq_filters(left, out)?;
                collect_eq_filters(right, out)
            }
            ast::BinaryOperator::Eq => {
                let col = expr_column_name(left)
                    .ok_or_else(|| SqlError::Unsupported(format!("filter on {left}")))?;
                out.insert(canonical_column(&col), right.as_ref());
                Ok(())
            }
            other => Err(SqlError::Unsupported(format!("operator {other} in WHERE"))),
        },
        other => Err(SqlError::Unsupported(format!("WHERE {other}"))),
    }
}

fn only_columns(filters: &BTreeMap<String, &Expr>, allowed: &[&str]) -> Result<(), SqlError> {
    match filters.keys().find(|k| !allowed.contains(&k.as_str())) {
        Some(unknown) => Err(SqlError::UnknownColumn(unknown.clone())),
        None => Ok(()),
    }
}

fn required<'a>(filters: &BTreeMap<String, &'a Expr>, column: &'static str) -> Result<&'a Expr, SqlError> {
    filters.get(column).copied().ok_or(SqlError::MissingFilter(column))
}

/// `resource_id` is accepted wherever `listing_id` is.
fn canonical_column(name: &str) -> String {
    let name = name.to_lowercase();
    if name == "resource_id" {
        "listing_id".to_string()
    } else {
        name
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

fn extract_insert_rows(insert: &ast::Insert) -> Result<&[Vec<Expr>], SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => {
            if values.rows.is_empty() {
                return Err(SqlError::Parse("empty VALUES".into()));
            }
            Ok(&values.rows)
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

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s) | Value::Number(s, _)) => Ok(s.clone()),
        Some(Value::Null) => Err(SqlError::InvalidValue("unexpected NULL".into())),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    let s = parse_string(expr)?;
    Ulid::from_string(&s).map_err(|e| SqlError::InvalidValue(format!("bad booking id {s:?}: {e}")))
}

fn parse_timestamp(expr: &Expr) -> Result<Ms, SqlError> {
    parse_instant(&parse_string(expr)?).map_err(SqlError::InvalidValue)
}

fn parse_date_expr(expr: &Expr) -> Result<NaiveDate, SqlError> {
    parse_date(&parse_string(expr)?).map_err(SqlError::InvalidValue)
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
    #[error("unknown column: {0}")]
    UnknownColumn(String),
    #[error("{0}: expected {1} values, got {2}")]
    WrongArity(&'static str, usize, usize),
    #[error("missing filter: {0}")]
    MissingFilter(&'static str),
    #[error("missing column: {0}")]
    MissingColumn(&'static str),
    /// Well-formed SQL carrying a value we cannot accept.
    #[error("invalid value: {0}")]
    InvalidValue(String),
}

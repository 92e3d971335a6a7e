use chrono::NaiveDate;
use sqlparser::ast::{self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value, ValueWithSpan};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use thiserror::Error;
use ulid::Ulid;

use crate::limits::MAX_SQL_LEN;
use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertBooking {
        request: BookingRequest,
        returning: bool,
    },
    InsertHold {
        request: HoldRequest,
        returning: bool,
    },
    CancelReservation {
        id: Ulid,
    },
    SelectAvailability {
        item_id: ItemId,
    },
    SelectReservations {
        item_id: ItemId,
    },
    SelectHealth,
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    if sql.len() > MAX_SQL_LEN {
        return Err(SqlError::TooLong(sql.len()));
    }
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let Some(first) = stmts.first() else {
        return Err(SqlError::Empty);
    };

    match first {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let values = extract_insert_values(insert)?;
    let returning = insert.returning.is_some();

    match table.as_str() {
        "bookings" => {
            let [item_id, holder_id, start, end] =
                values_by_column("bookings", BOOKING_COLUMNS, &insert.columns, &values)?;
            Ok(Command::InsertBooking {
                request: BookingRequest {
                    item_id: parse_i64(item_id)?,
                    holder_id: parse_i64(holder_id)?,
                    start: parse_date(start)?,
                    end: parse_date(end)?,
                },
                returning,
            })
        }
        "holds" => {
            let [item_id, start, end] =
                values_by_column("holds", HOLD_COLUMNS, &insert.columns, &values)?;
            Ok(Command::InsertHold {
                request: HoldRequest {
                    item_id: parse_i64(item_id)?,
                    start: parse_date(start)?,
                    end: parse_date(end)?,
                },
                returning,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

const BOOKING_COLUMNS: [&str; 4] = ["item_id", "holder_id", "start_date", "end_date"];
const HOLD_COLUMNS: [&str; 3] = ["item_id", "start_date", "end_date"];

/// Values in `expected` column order. Without a column list the values are
/// positional; with one, each expected column must be named exactly once.
fn values_by_column<'a, const N: usize>(
    table: &'static str,
    expected: [&'static str; N],
    columns: &[ast::Ident],
    values: &'a [Expr],
) -> Result<[&'a Expr; N], SqlError> {
    if values.len() != N {
        return Err(SqlError::WrongArity(table, N, values.len()));
    }
    if columns.is_empty() {
        return Ok(std::array::from_fn(|i| &values[i]));
    }
    if columns.len() != values.len() {
        return Err(SqlError::Parse(format!(
            "{} columns named for {} values",
            columns.len(),
            values.len()
        )));
    }
    let names: Vec<String> = columns.iter().map(|c| c.value.to_lowercase()).collect();
    let mut positions = [0usize; N];
    for (slot, column) in positions.iter_mut().zip(expected) {
        let mut found = names.iter().enumerate().filter(|(_, n)| *n == column);
        match (found.next(), found.next()) {
            (Some((i, _)), None) => *slot = i,
            (None, _) => return Err(SqlError::MissingColumn(table, column)),
            (Some(_), Some(_)) => {
                return Err(SqlError::Parse(format!("column {column} named twice")));
            }
        }
    }
    Ok(positions.map(|i| &values[i]))
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    match table.as_str() {
        "reservations" | "bookings" | "holds" => Ok(Command::CancelReservation {
            id: extract_where_id(&delete.selection)?,
        }),
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

    match table.as_str() {
        "health" => Ok(Command::SelectHealth),
        "availability" => Ok(Command::SelectAvailability {
            item_id: extract_where_item(&select.selection)?,
        }),
        "reservations" => Ok(Command::SelectReservations {
            item_id: extract_where_item(&select.selection)?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Find `item_id = N` anywhere in an AND-chain.
fn find_item_filter(expr: &Expr) -> Result<Option<ItemId>, SqlError> {
    match expr {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::And,
            right,
        } => match find_item_filter(left)? {
            Some(id) => Ok(Some(id)),
            None => find_item_filter(right),
        },
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } if expr_column_name(left).as_deref() == Some("item_id") => Ok(Some(parse_i64(right)?)),
        Expr::Nested(inner) => find_item_filter(inner),
        _ => Ok(None),
    }
}

fn extract_where_item(selection: &Option<Expr>) -> Result<ItemId, SqlError> {
    let sel = selection.as_ref().ok_or(SqlError::MissingFilter("item_id"))?;
    find_item_filter(sel)?.ok_or(SqlError::MissingFilter("item_id"))
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

/// Single-row VALUES only; one reservation per statement.
fn extract_insert_values(insert: &ast::Insert) -> Result<Vec<Expr>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [] => Err(SqlError::Parse("empty VALUES".into())),
            [row] => Ok(row.clone()),
            rows => Err(SqlError::Unsupported(format!(
                "multi-row INSERT ({} rows); insert one reservation per statement",
                rows.len()
            ))),
        },
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

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => {
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
                .map_err(|e| SqlError::Parse(format!("bad integer {s}: {e}"))),
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

/// ISO calendar date in a string literal, e.g. `'2024-01-10'`.
fn parse_date(expr: &Expr) -> Result<NaiveDate, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
            .map_err(|e| SqlError::Parse(format!("bad date {s}: {e}"))),
        Some(value) => Err(SqlError::Parse(format!("expected date string, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum SqlError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("empty query")]
    Empty,
    #[error("query too long: {0} bytes")]
    TooLong(usize),
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("unknown table: {0}")]
    UnknownTable(String),
    #[error("{0}: expected {1} values, got {2}")]
    WrongArity(&'static str, usize, usize),
    #[error("missing filter: {0}")]
    MissingFilter(&'static str),
    #[error("{0}: missing column {1}")]
    MissingColumn(&'static str, &'static str),
}

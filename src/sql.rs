use std::collections::HashMap;

use sqlparser::ast::{self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value, ValueWithSpan};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;

/// Parsed command from SQL input. Field values stay as the client sent them;
/// the engine's request parsers validate them.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertAppointment {
        practitioner_id: String,
        patient_id: String,
        start_at: String,
        end_at: String,
        notes: Option<String>,
    },
    /// `INSERT INTO reschedules`: NULL or omitted bounds keep their current value.
    InsertReschedule {
        appointment_id: String,
        start_at: Option<String>,
        end_at: Option<String>,
    },
    InsertAppointmentStatus {
        appointment_id: String,
        status: String,
        cancelled_reason: Option<String>,
    },
    InsertAppointmentNotes {
        appointment_id: String,
        notes: Option<String>,
    },
    /// `DELETE FROM appointments` cancels; appointments are never removed.
    CancelAppointment {
        appointment_id: String,
    },
    SelectAppointment {
        id: String,
    },
    SelectPractitionerDay {
        practitioner_id: String,
        date: String,
    },
    SelectPatientRange {
        patient_id: String,
        from: String,
        to: String,
    },
    InsertMaterial {
        name: String,
        description: Option<String>,
        total_qty: i64,
    },
    SelectMaterials {
        id: Option<String>,
        limit: Option<i64>,
    },
    InsertLoan {
        material_id: String,
        patient_id: String,
        practitioner_id: String,
        qty: i64,
        notes: Option<String>,
    },
    InsertReturn {
        loan_id: String,
    },
    SelectLoans {
        patient_id: String,
        only_active: bool,
        limit: Option<i64>,
    },
    SelectLoan {
        id: String,
    },
    SelectStockDrift,
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }

    match &stmts[0] {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;

    match table.as_str() {
        "appointments" => {
            let row = insert_row(
                insert,
                "appointments",
                &["practitioner_id", "patient_id", "start_at", "end_at", "notes"],
            )?;
            Ok(Command::InsertAppointment {
                practitioner_id: row.text("practitioner_id")?,
                patient_id: row.text("patient_id")?,
                start_at: row.text("start_at")?,
                end_at: row.text("end_at")?,
                notes: row.opt_text("notes")?,
            })
        }
        "reschedules" => {
            let row = insert_row(insert, "reschedules", &["appointment_id", "start_at", "end_at"])?;
            Ok(Command::InsertReschedule {
                appointment_id: row.text("appointment_id")?,
                start_at: row.opt_text("start_at")?,
                end_at: row.opt_text("end_at")?,
            })
        }
        "appointment_status" => {
            let row = insert_row(
                insert,
                "appointment_status",
                &["appointment_id", "status", "cancelled_reason"],
            )?;
            Ok(Command::InsertAppointmentStatus {
                appointment_id: row.text("appointment_id")?,
                status: row.text("status")?,
                cancelled_reason: row.opt_text("cancelled_reason")?,
            })
        }
        "appointment_notes" => {
            let row = insert_row(insert, "appointment_notes", &["appointment_id", "notes"])?;
            Ok(Command::InsertAppointmentNotes {
                appointment_id: row.text("appointment_id")?,
                notes: row.opt_text("notes")?,
            })
        }
        "materials" => {
            let row = insert_row(insert, "materials", &["name", "description", "total_qty"])?;
            Ok(Command::InsertMaterial {
                name: row.text("name")?,
                description: row.opt_text("description")?,
                total_qty: row.opt_int("total_qty")?.unwrap_or(0),
            })
        }
        "loans" => {
            let row = insert_row(
                insert,
                "loans",
                &["material_id", "patient_id", "practitioner_id", "qty", "notes"],
            )?;
            Ok(Command::InsertLoan {
                material_id: row.text("material_id")?,
                patient_id: row.text("patient_id")?,
                practitioner_id: row.text("practitioner_id")?,
                qty: row.int("qty")?,
                notes: row.opt_text("notes")?,
            })
        }
        "returns" => {
            let row = insert_row(insert, "returns", &["loan_id"])?;
            Ok(Command::InsertReturn {
                loan_id: row.text("loan_id")?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let filters = Filters::from_selection(delete.selection.as_ref())?;

    match table.as_str() {
        "appointments" => Ok(Command::CancelAppointment {
            appointment_id: filters.required_eq("id")?,
        }),
        _ => Err(SqlError::Unsupported(format!("DELETE FROM {table}"))),
    }
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
    let filters = Filters::from_selection(select.selection.as_ref())?;
    let limit = query_limit(query)?;

    match table.as_str() {
        "appointments" => {
            if let Some(id) = filters.eq("id")? {
                return Ok(Command::SelectAppointment { id });
            }
            if let Some(practitioner_id) = filters.eq("practitioner_id")? {
                return Ok(Command::SelectPractitionerDay {
                    practitioner_id,
                    date: filters.required_eq("date")?,
                });
            }
            if let Some(patient_id) = filters.eq("patient_id")? {
                return Ok(Command::SelectPatientRange {
                    patient_id,
                    from: filters.bound(&filters.gte, "start_at")?,
                    to: filters.bound(&filters.lte, "start_at")?,
                });
            }
            Err(SqlError::MissingFilter("id, practitioner_id or patient_id"))
        }
        "materials" => Ok(Command::SelectMaterials {
            id: filters.eq("id")?,
            limit,
        }),
        "loans" => {
            if let Some(id) = filters.eq("id")? {
                return Ok(Command::SelectLoan { id });
            }
            let only_active = match filters.eq.get("active") {
                Some(expr) => parse_bool(expr)?,
                None => false,
            };
            Ok(Command::SelectLoans {
                patient_id: filters.required_eq("patient_id")?,
                only_active,
                limit,
            })
        }
        "stock_drift" => Ok(Command::SelectStockDrift),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Column comparisons joined by `AND` in a WHERE clause.
#[derive(Default)]
struct Filters {
    eq: HashMap<String, Expr>,
    gte: HashMap<String, Expr>,
    lte: HashMap<String, Expr>,
}

impl Filters {
    fn from_selection(selection: Option<&Expr>) -> Result<Self, SqlError> {
        let mut filters = Filters::default();
        if let Some(expr) = selection {
            filters.collect(expr)?;
        }
        Ok(filters)
    }

    fn collect(&mut self, expr: &Expr) -> Result<(), SqlError> {
        match expr {
            Expr::Nested(inner) => self.collect(inner),
            Expr::BinaryOp { left, op, right } => {
                if let ast::BinaryOperator::And = op {
                    self.collect(left)?;
                    return self.collect(right);
                }
                let col = expr_column_name(left)
                    .ok_or_else(|| SqlError::Unsupported(format!("filter {expr}")))?;
                let slot = match op {
                    ast::BinaryOperator::Eq => &mut self.eq,
                    ast::BinaryOperator::GtEq => &mut self.gte,
                    ast::BinaryOperator::LtEq => &mut self.lte,
                    _ => return Err(SqlError::Unsupported(format!("operator {op}"))),
                };
                slot.insert(col, right.as_ref().clone());
                Ok(())
            }
            _ => Err(SqlError::Unsupported(format!("filter {expr}"))),
        }
    }

    fn eq(&self, col: &str) -> Result<Option<String>, SqlError> {
        match self.eq.get(col) {
            Some(expr) => expr_text(expr),
            None => Ok(None),
        }
    }

    fn required_eq(&self, col: &'static str) -> Result<String, SqlError> {
        self.eq(col)?.ok_or(SqlError::MissingFilter(col))
    }

    fn bound(&self, side: &HashMap<String, Expr>, col: &'static str) -> Result<String, SqlError> {
        match side.get(col) {
            Some(expr) => expr_text(expr)?.ok_or(SqlError::MissingFilter(col)),
            None => Err(SqlError::MissingFilter(col)),
        }
    }
}

/// The single VALUES row of an INSERT, keyed by column. Without an explicit
/// column list, values bind positionally to `default_columns`.
struct Row {
    table: &'static str,
    values: HashMap<String, Expr>,
}

fn insert_row(
    insert: &ast::Insert,
    table: &'static str,
    default_columns: &[&str],
) -> Result<Row, SqlError> {
    let rows = extract_all_insert_rows(insert)?;
    if rows.len() != 1 {
        return Err(SqlError::Unsupported(format!("{table}: multi-row INSERT")));
    }
    let values = &rows[0];
    let columns: Vec<String> = if insert.columns.is_empty() {
        default_columns.iter().map(|c| c.to_string()).collect()
    } else {
        insert.columns.iter().map(|c| c.value.to_lowercase()).collect()
    };
    if values.len() > columns.len() || (!insert.columns.is_empty() && values.len() != columns.len()) {
        return Err(SqlError::WrongArity(table, columns.len(), values.len()));
    }
    for col in columns.iter().take(values.len()) {
        if !default_columns.contains(&col.as_str()) {
            return Err(SqlError::UnknownColumn(table, col.clone()));
        }
    }
    Ok(Row {
        table,
        values: columns.into_iter().zip(values.iter().cloned()).collect(),
    })
}

impl Row {
    fn text(&self, col: &'static str) -> Result<String, SqlError> {
        self.opt_text(col)?
            .ok_or(SqlError::MissingValue(self.table, col))
    }

    fn opt_text(&self, col: &str) -> Result<Option<String>, SqlError> {
        match self.values.get(col) {
            Some(expr) => expr_text(expr),
            None => Ok(None),
        }
    }

    fn int(&self, col: &'static str) -> Result<i64, SqlError> {
        self.opt_int(col)?
            .ok_or(SqlError::MissingValue(self.table, col))
    }

    fn opt_int(&self, col: &str) -> Result<Option<i64>, SqlError> {
        match self.values.get(col) {
            Some(expr) if is_null(expr) => Ok(None),
            Some(expr) => parse_i64_expr(expr).map(Some),
            None => Ok(None),
        }
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

fn extract_all_insert_rows(insert: &ast::Insert) -> Result<Vec<Vec<Expr>>, SqlError> {
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

fn query_limit(query: &ast::Query) -> Result<Option<i64>, SqlError> {
    match &query.limit_clause {
        Some(ast::LimitClause::LimitOffset { limit: Some(expr), .. }) if !is_null(expr) => {
            parse_i64_expr(expr).map(Some)
        }
        Some(ast::LimitClause::OffsetCommaLimit { limit, .. }) => parse_i64_expr(limit).map(Some),
        _ => Ok(None),
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
        // '2024-05-01T10:00:00Z'::timestamptz and friends carry the literal inside.
        Expr::Cast { expr, .. } | Expr::Nested(expr) => extract_value(expr),
        _ => None,
    }
}

fn is_null(expr: &Expr) -> bool {
    matches!(extract_value(expr), Some(Value::Null))
}

/// A literal as text; NULL is `None`.
fn expr_text(expr: &Expr) -> Result<Option<String>, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Null => Ok(None),
            Value::SingleQuotedString(s) | Value::Number(s, _) => Ok(Some(s.clone())),
            Value::Boolean(b) => Ok(Some(b.to_string())),
            _ => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(expr_text(expr)?.map(|s| format!("-{s}")))
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_i64_expr(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad integer: {e}"))),
            Value::SingleQuotedString(s) => s
                .trim()
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad integer: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value:?}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_i64_expr(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
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

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    UnknownColumn(&'static str, String),
    WrongArity(&'static str, usize, usize),
    MissingValue(&'static str, &'static str),
    MissingFilter(&'static str),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::UnknownColumn(t, c) => write!(f, "{t}: unknown column {c}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::MissingValue(t, c) => write!(f, "{t}: {c} is required"),
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}

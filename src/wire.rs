use std::fmt::Debug;
use std::io;
use std::ops::Range;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use futures::stream;
use futures::Sink;
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{
    AuthSource, DefaultServerParameterProvider, LoginInfo, Password, StartupHandler,
};
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldFormat, FieldInfo,
    QueryResponse, Response,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;

use crate::engine::request::*;
use crate::engine::{Conflict, Engine, EngineError, StockDrift};
use crate::model::*;
use crate::observability::{command_label, QUERIES_TOTAL, QUERY_DURATION_SECONDS};
use crate::sql::{self, Command};

pub struct KinedeskHandler {
    engine: Arc<Engine>,
    query_parser: Arc<KinedeskQueryParser>,
}

impl KinedeskHandler {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            query_parser: Arc::new(KinedeskQueryParser),
        }
    }

    /// Parse, execute and record one statement.
    async fn run(&self, sql: &str) -> PgWireResult<Response> {
        let cmd = match sql::parse_sql(sql) {
            Ok(cmd) => cmd,
            Err(e) => {
                metrics::counter!(QUERIES_TOTAL, "command" => "unparsed", "status" => "error")
                    .increment(1);
                return Err(sql_err(e));
            }
        };
        let label = command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(cmd).await;
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        let status = match &result {
            Ok(_) => "ok",
            Err(e) => e.kind(),
        };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        result.map_err(engine_err)
    }

    async fn execute_command(&self, cmd: Command) -> Result<Response, EngineError> {
        let scheduler = &self.engine.scheduler;
        let ledger = &self.engine.ledger;
        match cmd {
            Command::InsertAppointment {
                practitioner_id,
                patient_id,
                start_at,
                end_at,
                notes,
            } => {
                let req = CreateAppointment::parse(
                    &practitioner_id,
                    &patient_id,
                    &start_at,
                    &end_at,
                    notes.as_deref(),
                )?;
                appointment_rows(vec![scheduler.create(req).await?])
            }
            Command::InsertReschedule {
                appointment_id,
                start_at,
                end_at,
            } => {
                let req = Reschedule::parse(&appointment_id, start_at.as_deref(), end_at.as_deref())?;
                appointment_rows(vec![scheduler.reschedule(req).await?])
            }
            Command::InsertAppointmentStatus {
                appointment_id,
                status,
                cancelled_reason,
            } => {
                let req = SetStatus::parse(&appointment_id, &status, cancelled_reason.as_deref())?;
                appointment_rows(vec![scheduler.set_status(req).await?])
            }
            Command::InsertAppointmentNotes {
                appointment_id,
                notes,
            } => {
                let req = UpdateNotes::parse(&appointment_id, notes.as_deref())?;
                appointment_rows(vec![scheduler.update_notes(req).await?])
            }
            Command::CancelAppointment { appointment_id } => {
                let id = parse_id("id", &appointment_id)?;
                appointment_rows(vec![scheduler.cancel(id, None).await?])
            }
            Command::SelectAppointment { id } => {
                let id = parse_id("id", &id)?;
                appointment_rows(vec![scheduler.get(id).await?])
            }
            Command::SelectPractitionerDay {
                practitioner_id,
                date,
            } => {
                let query = PractitionerDay::parse(&practitioner_id, &date)?;
                appointment_rows(scheduler.list_for_practitioner_day(query).await?)
            }
            Command::SelectPatientRange {
                patient_id,
                from,
                to,
            } => {
                let query = PatientRange::parse(&patient_id, &from, &to)?;
                appointment_rows(scheduler.list_for_patient_in_range(query).await?)
            }
            Command::InsertMaterial {
                name,
                description,
                total_qty,
            } => {
                let req = CreateMaterial::parse(&name, description.as_deref(), total_qty)?;
                material_rows(vec![ledger.create_material(req).await?])
            }
            Command::SelectMaterials { id: Some(id), .. } => {
                let id = parse_id("id", &id)?;
                material_rows(vec![ledger.get_material(id).await?])
            }
            Command::SelectMaterials { id: None, limit } => {
                material_rows(ledger.list_materials(limit).await?)
            }
            Command::InsertLoan {
                material_id,
                patient_id,
                practitioner_id,
                qty,
                notes,
            } => {
                let req = LoanRequest::parse(
                    &material_id,
                    &patient_id,
                    &practitioner_id,
                    qty,
                    notes.as_deref(),
                )?;
                loan_rows(vec![ledger.loan(req).await?])
            }
            Command::InsertReturn { loan_id } => {
                let id = parse_id("loan_id", &loan_id)?;
                loan_rows(vec![ledger.return_loan(id).await?])
            }
            Command::SelectLoans {
                patient_id,
                only_active,
                limit,
            } => {
                let query = PatientLoans::parse(&patient_id, only_active, limit)?;
                loan_rows(ledger.list_loans_by_patient(query).await?)
            }
            Command::SelectLoan { id } => {
                let id = parse_id("id", &id)?;
                loan_rows(vec![ledger.get_loan(id).await?])
            }
            Command::SelectStockDrift => drift_rows(ledger.audit_stock().await?),
        }
    }
}

// ── Result sets ──────────────────────────────────────────────────

fn varchar(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text)
}

fn int8(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::INT8, FieldFormat::Text)
}

fn appointment_schema() -> Vec<FieldInfo> {
    vec![
        varchar("id"),
        varchar("practitioner_id"),
        varchar("patient_id"),
        varchar("start_at"),
        varchar("end_at"),
        varchar("status"),
        varchar("notes"),
        varchar("cancelled_reason"),
        varchar("created_at"),
        varchar("updated_at"),
    ]
}

fn material_schema() -> Vec<FieldInfo> {
    vec![
        varchar("id"),
        varchar("name"),
        varchar("description"),
        int8("total_qty"),
        int8("available_qty"),
        varchar("created_at"),
        varchar("updated_at"),
    ]
}

fn loan_schema() -> Vec<FieldInfo> {
    vec![
        varchar("id"),
        varchar("material_id"),
        varchar("patient_id"),
        varchar("practitioner_id"),
        int8("qty"),
        varchar("notes"),
        varchar("loaned_at"),
        varchar("returned_at"),
    ]
}

fn drift_schema() -> Vec<FieldInfo> {
    vec![
        varchar("material_id"),
        int8("total_qty"),
        int8("available_qty"),
        int8("outstanding_qty"),
    ]
}

/// RFC 3339, UTC, millisecond precision.
pub fn format_instant(ms: Ms) -> String {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .map(|t| t.to_rfc3339_opts(SecondsFormat::Millis, true))
        .unwrap_or_else(|| ms.to_string())
}

fn rows<T>(
    schema: Vec<FieldInfo>,
    items: Vec<T>,
    encode: impl Fn(&mut DataRowEncoder, &T) -> PgWireResult<()>,
) -> Result<Response, EngineError> {
    let schema = Arc::new(schema);
    let rows: Vec<PgWireResult<_>> = items
        .iter()
        .map(|item| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encode(&mut encoder, item)?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

fn appointment_rows(items: Vec<Appointment>) -> Result<Response, EngineError> {
    rows(appointment_schema(), items, |e, a| {
        e.encode_field(&a.id.to_string())?;
        e.encode_field(&a.practitioner_id.to_string())?;
        e.encode_field(&a.patient_id.to_string())?;
        e.encode_field(&format_instant(a.span.start))?;
        e.encode_field(&format_instant(a.span.end))?;
        e.encode_field(&a.status.as_str().to_string())?;
        e.encode_field(&a.notes)?;
        e.encode_field(&a.cancelled_reason)?;
        e.encode_field(&format_instant(a.created_at))?;
        e.encode_field(&format_instant(a.updated_at))
    })
}

fn material_rows(items: Vec<Material>) -> Result<Response, EngineError> {
    rows(material_schema(), items, |e, m| {
        e.encode_field(&m.id.to_string())?;
        e.encode_field(&m.name)?;
        e.encode_field(&m.description)?;
        e.encode_field(&(m.total_qty as i64))?;
        e.encode_field(&(m.available_qty as i64))?;
        e.encode_field(&format_instant(m.created_at))?;
        e.encode_field(&format_instant(m.updated_at))
    })
}

fn loan_rows(items: Vec<MaterialLoan>) -> Result<Response, EngineError> {
    rows(loan_schema(), items, |e, l| {
        e.encode_field(&l.id.to_string())?;
        e.encode_field(&l.material_id.to_string())?;
        e.encode_field(&l.patient_id.to_string())?;
        e.encode_field(&l.practitioner_id.to_string())?;
        e.encode_field(&(l.qty as i64))?;
        e.encode_field(&l.notes)?;
        e.encode_field(&format_instant(l.loaned_at))?;
        e.encode_field(&l.returned_at.map(format_instant))
    })
}

fn drift_rows(items: Vec<StockDrift>) -> Result<Response, EngineError> {
    rows(drift_schema(), items, |e, d| {
        e.encode_field(&d.material_id.to_string())?;
        e.encode_field(&(d.total_qty as i64))?;
        e.encode_field(&(d.available_qty as i64))?;
        e.encode_field(&(d.outstanding_qty as i64))
    })
}

/// Row shape a statement will produce, judged from the table it targets.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    match target_table(sql).as_deref() {
        Some("appointments" | "reschedules" | "appointment_status" | "appointment_notes") => {
            appointment_schema()
        }
        Some("materials") => material_schema(),
        Some("loans" | "returns") => loan_schema(),
        Some("stock_drift") => drift_schema(),
        _ => vec![],
    }
}

/// The identifier following the first `INTO` or `FROM`.
fn target_table(sql: &str) -> Option<String> {
    let lower = sql.to_lowercase();
    let mut words = lower.split_whitespace();
    while let Some(word) = words.next() {
        if word == "into" || word == "from" {
            let name = words.next()?;
            let name = name
                .split(|c: char| c == '(' || c == ';')
                .next()?
                .trim_matches('"');
            return Some(name.rsplit('.').next()?.to_string());
        }
    }
    None
}

#[async_trait]
impl SimpleQueryHandler for KinedeskHandler {
    async fn do_query<C>(
        &self,
        _client: &mut C,
        query: &str,
    ) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(vec![self.run(query).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct KinedeskQueryParser;

#[async_trait]
impl QueryParser for KinedeskQueryParser {
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
impl ExtendedQueryHandler for KinedeskHandler {
    type Statement = String;
    type QueryParser = KinedeskQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        _client: &mut C,
        portal: &Portal<Self::Statement>,
        _max_rows: usize,
    ) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let sql = substitute_params(portal);
        self.run(&sql).await
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

/// `$N` placeholders outside quoted text, as (byte range, N).
fn placeholders(sql: &str) -> Vec<(Range<usize>, usize)> {
    let bytes = sql.as_bytes();
    let mut found = Vec::new();
    let mut quote: Option<u8> = None;
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        match quote {
            // A doubled quote closes and reopens, which leaves the state unchanged.
            Some(q) => {
                if b == q {
                    quote = None;
                }
                i += 1;
            }
            None if b == b'\'' || b == b'"' => {
                quote = Some(b);
                i += 1;
            }
            None if b == b'$' => {
                let start = i;
                i += 1;
                let digits = i;
                while i < bytes.len() && bytes[i].is_ascii_digit() {
                    i += 1;
                }
                if let Ok(n) = sql[digits..i].parse::<usize>() {
                    found.push((start..i, n));
                }
            }
            None => i += 1,
        }
    }
    found
}

/// Highest `$N` placeholder in the statement.
fn count_params(sql: &str) -> usize {
    placeholders(sql).iter().map(|(_, n)| *n).max().unwrap_or(0)
}

/// Splice text parameters into the statement as quoted literals in one pass,
/// so inlined values are never scanned again. Unbound placeholders stay as written.
fn bind_params(sql: &str, params: &[Option<String>]) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut last = 0;
    for (range, n) in placeholders(sql) {
        out.push_str(&sql[last..range.start]);
        match n.checked_sub(1).and_then(|i| params.get(i)) {
            Some(Some(text)) => {
                out.push('\'');
                out.push_str(&text.replace('\'', "''"));
                out.push('\'');
            }
            Some(None) => out.push_str("NULL"),
            None => out.push_str(&sql[range.clone()]),
        }
        last = range.end;
    }
    out.push_str(&sql[last..]);
    out
}

fn substitute_params(portal: &Portal<String>) -> String {
    let params: Vec<Option<String>> = portal
        .parameters
        .iter()
        .map(|p| p.as_ref().map(|bytes| String::from_utf8_lossy(bytes).into_owned()))
        .collect();
    bind_params(&portal.statement.statement, &params)
}

// ── Factory ──────────────────────────────────────────────────────

/// Clinic staff share one password; the user name is informational.
#[derive(Debug)]
struct StaffPassword(Vec<u8>);

#[async_trait]
impl AuthSource for StaffPassword {
    async fn get_password(&self, _login: &LoginInfo) -> PgWireResult<Password> {
        Ok(Password::new(None, self.0.clone()))
    }
}

pub struct KinedeskFactory {
    handler: Arc<KinedeskHandler>,
    auth_handler: Arc<
        CleartextPasswordAuthStartupHandler<StaffPassword, DefaultServerParameterProvider>,
    >,
    noop: Arc<NoopHandler>,
}

impl KinedeskFactory {
    pub fn new(engine: Arc<Engine>, password: String) -> Self {
        Self {
            handler: Arc::new(KinedeskHandler::new(engine)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                StaffPassword(password.into_bytes()),
                DefaultServerParameterProvider::default(),
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for KinedeskFactory {
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

/// Serve one client connection until it closes.
pub async fn process_connection(
    socket: TcpStream,
    factory: Arc<KinedeskFactory>,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

/// SQLSTATE for an engine error.
pub fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::Validation(_) => "22023",
        EngineError::NotFound { .. } => "P0002",
        EngineError::Conflict(Conflict::Overlap(_)) => "23P01",
        EngineError::Conflict(Conflict::InsufficientStock { .. }) => "23514",
        EngineError::Conflict(Conflict::DuplicateName(_)) => "23505",
        EngineError::Conflict(Conflict::AlreadyReturned(_)) => "55000",
        EngineError::Store(_) | EngineError::StockInconsistent { .. } => "XX000",
    }
}

/// Client-facing message. Validation errors carry a JSON object of field → reason.
fn error_message(e: &EngineError) -> String {
    match e {
        EngineError::Validation(fields) => {
            let map: serde_json::Map<String, serde_json::Value> = fields
                .iter()
                .map(|f| (f.field.to_string(), serde_json::Value::String(f.reason.clone())))
                .collect();
            format!("validation error: {}", serde_json::Value::Object(map))
        }
        other => other.to_string(),
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        sqlstate(&e).into(),
        error_message(&e),
    )))
}

fn sql_err(e: crate::sql::SqlError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "42601".into(),
        e.to_string(),
    )))
}

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
use pgwire::tokio::{process_socket, TlsAcceptor};
use tokio::net::TcpStream;

use crate::auth::ServiceCredentials;
use crate::engine::{Engine, EngineError};
use crate::model::*;
use crate::observability::{command_label, QUERIES_TOTAL, QUERY_DURATION_SECONDS};
use crate::sql::{self, Command, SqlError};

pub struct DaybookHandler {
    engine: Arc<Engine>,
    query_parser: Arc<DaybookQueryParser>,
}

impl DaybookHandler {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            query_parser: Arc::new(DaybookQueryParser),
        }
    }

    /// Parse, execute and record metrics for one statement.
    async fn run_statement(&self, sql: &str) -> PgWireResult<Response> {
        let cmd = sql::parse_sql(sql).map_err(sql_err)?;
        let label = command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(&self, cmd: Command) -> PgWireResult<Response> {
        match cmd {
            Command::InsertBooking { request, returning } => {
                let created = self.engine.create_booking(request).await.map_err(engine_err)?;
                Ok(inserted(&created, returning))
            }
            Command::InsertHold { request, returning } => {
                let created = self.engine.create_hold(request).await.map_err(engine_err)?;
                Ok(inserted(&created, returning))
            }
            Command::CancelReservation { id } => {
                self.engine.cancel(id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::SelectAvailability { item_id } => {
                let calendar = self.engine.availability(item_id).await;
                let schema = Arc::new(availability_schema());
                let rows: Vec<PgWireResult<_>> = calendar
                    .booked_dates
                    .iter()
                    .map(|date| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&calendar.item_id)?;
                        encoder.encode_field(&date.to_string())?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
            Command::SelectReservations { item_id } => {
                let reservations = self.engine.list_reservations(item_id).await;
                Ok(reservation_rows(&reservations))
            }
            Command::SelectHealth => {
                let schema = Arc::new(health_schema());
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&"ok".to_string())?;
                let rows = vec![Ok(encoder.take_row())];
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
        }
    }
}

fn inserted(reservation: &Reservation, returning: bool) -> Response {
    if returning {
        reservation_rows(std::slice::from_ref(reservation))
    } else {
        Response::Execution(Tag::new("INSERT").with_rows(1))
    }
}

fn reservation_rows(reservations: &[Reservation]) -> Response {
    let schema = Arc::new(reservation_schema());
    let rows: Vec<PgWireResult<_>> = reservations
        .iter()
        .map(|r| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&r.id.to_string())?;
            encoder.encode_field(&r.item_id)?;
            encoder.encode_field(&r.holder_id)?;
            encoder.encode_field(&r.range.start.to_string())?;
            encoder.encode_field(&r.range.end.to_string())?;
            encoder.encode_field(&r.status.as_str().to_string())?;
            encoder.encode_field(&r.is_hold)?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn text_field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn reservation_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id", Type::VARCHAR),
        text_field("item_id", Type::INT8),
        text_field("holder_id", Type::INT8),
        text_field("start_date", Type::VARCHAR),
        text_field("end_date", Type::VARCHAR),
        text_field("status", Type::VARCHAR),
        text_field("is_hold", Type::BOOL),
    ]
}

fn availability_schema() -> Vec<FieldInfo> {
    vec![
        text_field("item_id", Type::INT8),
        text_field("booked_date", Type::VARCHAR),
    ]
}

fn health_schema() -> Vec<FieldInfo> {
    vec![text_field("status", Type::VARCHAR)]
}

/// Result columns for a statement, from its text alone (parameters unbound).
fn result_schema(stmt: &str) -> Vec<FieldInfo> {
    let upper = stmt.to_uppercase();
    if upper.contains("RETURNING") {
        reservation_schema()
    } else if !upper.trim_start().starts_with("SELECT") {
        vec![]
    } else if upper.contains("AVAILABILITY") {
        availability_schema()
    } else if upper.contains("RESERVATIONS") {
        reservation_schema()
    } else if upper.contains("HEALTH") {
        health_schema()
    } else {
        vec![]
    }
}

#[async_trait]
impl SimpleQueryHandler for DaybookHandler {
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
        Ok(vec![self.run_statement(query).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct DaybookQueryParser;

#[async_trait]
impl QueryParser for DaybookQueryParser {
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
impl ExtendedQueryHandler for DaybookHandler {
    type Statement = String;
    type QueryParser = DaybookQueryParser;

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
        self.run_statement(&sql).await
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

/// Highest `$N` placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    let mut max = 0usize;
    let bytes = sql.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'$' {
            i += 1;
            let start = i;
            while i < bytes.len() && bytes[i].is_ascii_digit() {
                i += 1;
            }
            if let Ok(n) = sql[start..i].parse::<usize>() {
                max = max.max(n);
            }
        } else {
            i += 1;
        }
    }
    max
}

fn substitute_params(portal: &Portal<String>) -> String {
    bind_params(&portal.statement.statement, &portal.parameters)
}

/// Replace each `$N` in `sql` with the N-th bound value as a quoted literal,
/// in one pass over the statement text so bound values are never rescanned.
/// Placeholders without a bound value are left as written.
fn bind_params<P: AsRef<[u8]>>(sql: &str, params: &[Option<P>]) -> String {
    let bytes = sql.as_bytes();
    let mut out = String::with_capacity(sql.len());
    let mut copied = 0;
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'$' {
            i += 1;
            continue;
        }
        let digits = i + 1;
        let mut j = digits;
        while j < bytes.len() && bytes[j].is_ascii_digit() {
            j += 1;
        }
        let bound = sql[digits..j]
            .parse::<usize>()
            .ok()
            .and_then(|n| n.checked_sub(1))
            .and_then(|idx| params.get(idx));
        if let Some(param) = bound {
            out.push_str(&sql[copied..i]);
            match param {
                Some(value) => {
                    let text = String::from_utf8_lossy(value.as_ref());
                    out.push('\'');
                    out.push_str(&text.replace('\'', "''"));
                    out.push('\'');
                }
                None => out.push_str("NULL"),
            }
            copied = j;
        }
        i = j;
    }
    out.push_str(&sql[copied..]);
    out
}

// ── Factory ──────────────────────────────────────────────────────

pub struct DaybookFactory {
    handler: Arc<DaybookHandler>,
    auth_handler: Arc<
        CleartextPasswordAuthStartupHandler<ServiceCredentials, DefaultServerParameterProvider>,
    >,
    noop: Arc<NoopHandler>,
}

impl DaybookFactory {
    pub fn new(engine: Arc<Engine>, credentials: ServiceCredentials) -> Self {
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(DaybookHandler::new(engine)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                credentials,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for DaybookFactory {
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
    engine: Arc<Engine>,
    credentials: ServiceCredentials,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    let factory = DaybookFactory::new(engine, credentials);
    process_socket(socket, tls, factory).await
}

// ── Error mapping ────────────────────────────────────────────────

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new("ERROR".into(), code.into(), message)))
}

fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::Validation(_) => "22023",
        EngineError::Conflict { .. } => "23P01",
        EngineError::NotFound(_) => "P0002",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::Persistence(_) => "58030",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    user_error(sqlstate(&e), e.to_string())
}

fn sql_err(e: SqlError) -> PgWireError {
    user_error("42601", e.to_string())
}

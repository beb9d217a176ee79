use std::fmt::Debug;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::Sink;
use futures::stream;
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{DefaultServerParameterProvider, StartupHandler};
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldInfo, QueryResponse,
    Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;

use crate::auth::{AUTH_TOKEN_KEY, BearerToken, BookdAuthSource};
use crate::engine::{AvailabilityEngine, CreateBooking, EngineError};
use crate::model::*;
use crate::observability;
use crate::sql::{self, BookingFilter, Command, SqlError};

pub struct BookdHandler {
    engine: Arc<AvailabilityEngine>,
    query_parser: Arc<BookdQueryParser>,
}

impl BookdHandler {
    pub fn new(engine: Arc<AvailabilityEngine>) -> Self {
        Self {
            engine,
            query_parser: Arc::new(BookdQueryParser),
        }
    }

    /// Parse and run one statement, recording query metrics.
    async fn run<C: ClientInfo>(
        &self,
        client: &mut C,
        query: &str,
        format: &Format,
    ) -> PgWireResult<Response> {
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        let label = observability::command_label(&cmd);
        let started = Instant::now();

        let result = self.execute_command(client, cmd, format).await;

        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn execute_command<C: ClientInfo>(
        &self,
        client: &mut C,
        cmd: Command,
        format: &Format,
    ) -> PgWireResult<Response> {
        let engine = &self.engine;
        match cmd {
            Command::SetAuthToken { token } => {
                client
                    .metadata_mut()
                    .insert(AUTH_TOKEN_KEY.to_string(), token.as_header().to_string());
                Ok(Response::Execution(Tag::new("SET")))
            }
            Command::ResetAuthToken => {
                client.metadata_mut().remove(AUTH_TOKEN_KEY);
                Ok(Response::Execution(Tag::new("RESET")))
            }
            Command::InsertBooking {
                resource_id,
                user_id,
                owner_id,
                start,
                end,
            } => {
                let token = session_token(client);
                let req = CreateBooking {
                    resource_id,
                    user_id,
                    owner_id,
                    start,
                    end,
                };
                let booking = engine
                    .create_booking(req, token.as_ref())
                    .await
                    .map_err(engine_err)?;
                booking_rows(vec![booking], format)
            }
            Command::DeleteBooking { id } => {
                engine.remove_booking(id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::SelectBookings { filter } => {
                let bookings = match filter {
                    BookingFilter::All => engine.list_all().await,
                    BookingFilter::Id(id) => engine.get_booking(id).await.map(|b| vec![b]),
                    BookingFilter::User(user_id) => engine.list_by_user(&user_id).await,
                    BookingFilter::Resource(resource_id) => {
                        engine.list_by_resource(&resource_id).await
                    }
                    BookingFilter::ResourceDay { resource_id, date } => {
                        engine.list_by_resource_and_day(&resource_id, date).await
                    }
                }
                .map_err(engine_err)?;
                booking_rows(bookings, format)
            }
            Command::SelectAvailability {
                resource_id,
                start,
                end,
            } => {
                let token = session_token(client);
                let available = engine
                    .is_available_interval(&resource_id, start, end, token.as_ref())
                    .await
                    .map_err(engine_err)?;
                availability_row(available, format)
            }
            Command::SelectAvailabilityAt { resource_id, at } => {
                let token = session_token(client);
                let available = engine
                    .is_available_at_moment(&resource_id, at, token.as_ref())
                    .await
                    .map_err(engine_err)?;
                availability_row(available, format)
            }
            Command::SelectDailyAvailability { resource_id, date } => {
                let daily = engine
                    .daily_availability(&resource_id, date)
                    .await
                    .map_err(engine_err)?;
                let hours = serde_json::to_string(&daily.hours).map_err(|e| {
                    user_error("XX000", format!("encoding hours: {e}"))
                })?;
                let schema = Arc::new(daily_schema(format));
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&daily.date.format("%Y-%m-%d").to_string())?;
                encoder.encode_field(&hours)?;
                let rows = vec![Ok(encoder.take_row())];
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
        }
    }
}

fn session_token<C: ClientInfo>(client: &C) -> Option<BearerToken> {
    client
        .metadata()
        .get(AUTH_TOKEN_KEY)
        .and_then(|header| BearerToken::parse(header).ok())
}

// ── Result sets ──────────────────────────────────────────────────

const BOOKING_COLUMNS: [&str; 10] = [
    "id",
    "listing_id",
    "user_id",
    "owner_id",
    "start_time",
    "end_time",
    "status",
    "payment_status",
    "created_at",
    "updated_at",
];

fn text_fields(names: &[&str], format: &Format) -> Vec<FieldInfo> {
    names
        .iter()
        .enumerate()
        .map(|(i, name)| {
            FieldInfo::new(name.to_string(), None, None, Type::VARCHAR, format.format_for(i))
        })
        .collect()
}

fn booking_schema(format: &Format) -> Vec<FieldInfo> {
    text_fields(&BOOKING_COLUMNS, format)
}

fn availability_schema(format: &Format) -> Vec<FieldInfo> {
    vec![FieldInfo::new(
        "available".into(),
        None,
        None,
        Type::BOOL,
        format.format_for(0),
    )]
}

fn daily_schema(format: &Format) -> Vec<FieldInfo> {
    text_fields(&["date", "hours"], format)
}

fn booking_rows(bookings: Vec<Booking>, format: &Format) -> PgWireResult<Response> {
    let schema = Arc::new(booking_schema(format));
    let rows: Vec<PgWireResult<_>> = bookings
        .into_iter()
        .map(|b| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&b.id.to_string())?;
            encoder.encode_field(&b.resource_id)?;
            encoder.encode_field(&b.user_id)?;
            encoder.encode_field(&b.owner_id)?;
            encoder.encode_field(&format_instant(b.span.start))?;
            encoder.encode_field(&format_instant(b.span.end))?;
            encoder.encode_field(&b.status.as_str().to_string())?;
            encoder.encode_field(&b.payment_status.as_str().to_string())?;
            encoder.encode_field(&format_instant(b.created_at))?;
            encoder.encode_field(&format_instant(b.updated_at))?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

fn availability_row(available: bool, format: &Format) -> PgWireResult<Response> {
    let schema = Arc::new(availability_schema(format));
    let mut encoder = DataRowEncoder::new(schema.clone());
    encoder.encode_field(&available)?;
    let rows = vec![Ok(encoder.take_row())];
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

/// Result columns a statement will produce, judged from its text alone so
/// it works before parameters are bound.
fn result_schema(sql: &str, format: &Format) -> Vec<FieldInfo> {
    let upper = sql.trim_start().to_uppercase();
    let is_select = upper.starts_with("SELECT");
    if is_select && upper.contains("DAILY_AVAILABILITY") {
        daily_schema(format)
    } else if is_select && upper.contains("AVAILABILITY") {
        availability_schema(format)
    } else if (is_select || upper.starts_with("INSERT")) && upper.contains("BOOKINGS") {
        booking_schema(format)
    } else {
        vec![]
    }
}

#[async_trait]
impl SimpleQueryHandler for BookdHandler {
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
        let response = self.run(client, query, &Format::UnifiedText).await?;
        Ok(vec![response])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct BookdQueryParser;

#[async_trait]
impl QueryParser for BookdQueryParser {
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
        column_format: Option<&Format>,
    ) -> PgWireResult<Vec<FieldInfo>> {
        Ok(result_schema(stmt, column_format.unwrap_or(&Format::UnifiedText)))
    }
}

#[async_trait]
impl ExtendedQueryHandler for BookdHandler {
    type Statement = String;
    type QueryParser = BookdQueryParser;

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
        let sql = substitute_params(portal);
        self.run(client, &sql, &portal.result_column_format).await
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
            result_schema(&target.statement, &Format::UnifiedText),
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
            &target.result_column_format,
        )))
    }
}

/// Count the highest $N parameter placeholder in the SQL string.
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
            if i > start
                && let Ok(n) = sql[start..i].parse::<usize>()
            {
                max = max.max(n);
            }
        } else {
            i += 1;
        }
    }
    max
}

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
fn substitute_params(portal: &Portal<String>) -> String {
    let params: Vec<Option<String>> = portal
        .parameters
        .iter()
        .map(|p| p.as_ref().map(|bytes| String::from_utf8_lossy(bytes).into_owned()))
        .collect();
    substitute(&portal.statement.statement, &params)
}

/// Replace each `$N` with its quoted value in one left-to-right pass, so text
/// inside a bound value is never rescanned. Unbound indexes stay as written.
fn substitute(sql: &str, params: &[Option<String>]) -> String {
    let mut result = String::with_capacity(sql.len());
    let mut rest = sql;
    while let Some(pos) = rest.find('$') {
        result.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];
        let digits = after.bytes().take_while(u8::is_ascii_digit).count();
        let bound = after[..digits]
            .parse::<usize>()
            .ok()
            .and_then(|n| n.checked_sub(1))
            .and_then(|i| params.get(i));
        match bound {
            Some(Some(text)) => {
                result.push('\'');
                result.push_str(&text.replace('\'', "''"));
                result.push('\'');
            }
            Some(None) => result.push_str("NULL"),
            None => result.push_str(&rest[pos..pos + 1 + digits]),
        }
        rest = &after[digits..];
    }
    result.push_str(rest);
    result
}

// ── Factory ──────────────────────────────────────────────────────

pub struct BookdFactory {
    handler: Arc<BookdHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<BookdAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl BookdFactory {
    pub fn new(engine: Arc<AvailabilityEngine>, password: String) -> Self {
        let auth_source = BookdAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(BookdHandler::new(engine)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for BookdFactory {
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
    engine: Arc<AvailabilityEngine>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    let factory = BookdFactory::new(engine, password);
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        code.into(),
        message,
    )))
}

/// Stable SQLSTATE for each engine error kind.
fn engine_sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::InvalidInterval { .. } | EngineError::InvalidInput(_) => "22023",
        EngineError::Unauthorized(_) => "28000",
        EngineError::NotFound(_) => "P0002",
        EngineError::Conflict(_) => "23P01",
        EngineError::Upstream(_) => "08001",
        EngineError::StorageFailure(_) => "58030",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    match &e {
        EngineError::Unauthorized(_) => {
            metrics::counter!(observability::AUTH_FAILURES_TOTAL).increment(1);
        }
        EngineError::StorageFailure(msg) => tracing::error!("storage failure: {msg}"),
        _ => {}
    }
    user_error(engine_sqlstate(&e), e.to_string())
}

fn sql_err(e: SqlError) -> PgWireError {
    let code = match &e {
        SqlError::InvalidValue(_) => "22023",
        _ => "42601",
    };
    user_error(code, e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    #[test]
    fn sqlstates_are_stable() {
        let cases = [
            (EngineError::InvalidInterval { start: 1, end: 1 }, "22023"),
            (EngineError::InvalidInput("x".into()), "22023"),
            (EngineError::Unauthorized("x".into()), "28000"),
            (EngineError::NotFound("x".into()), "P0002"),
            (EngineError::Conflict(Ulid::nil()), "23P01"),
            (EngineError::Upstream("x".into()), "08001"),
            (EngineError::StorageFailure("x".into()), "58030"),
        ];
        for (e, code) in cases {
            assert_eq!(engine_sqlstate(&e), code, "{e}");
        }
    }

    #[test]
    fn schema_follows_statement_kind() {
        let text = Format::UnifiedText;
        let names = |fields: Vec<FieldInfo>| -> Vec<String> {
            fields.iter().map(|f| f.name().to_string()).collect()
        };
        assert_eq!(
            names(result_schema("SELECT * FROM daily_availability WHERE listing_id = $1", &text)),
            vec!["date", "hours"]
        );
        assert_eq!(
            names(result_schema("select * from availability where listing_id = $1", &text)),
            vec!["available"]
        );
        assert_eq!(names(result_schema("INSERT INTO bookings VALUES ($1)", &text)).len(), 10);
        assert!(result_schema("DELETE FROM bookings WHERE id = $1", &text).is_empty());
        assert!(result_schema("SET auth_token = $1", &text).is_empty());
    }

    #[test]
    fn params_are_counted_and_quoted() {
        assert_eq!(count_params("SELECT * FROM bookings"), 0);
        assert_eq!(count_params("... $1 AND $2 AND $10"), 10);

        let sql = "SELECT * FROM bookings WHERE user_id = $1 AND listing_id = $10";
        let mut params = vec![None; 10];
        params[0] = Some("o'brien".to_string());
        params[9] = Some("R1".to_string());
        assert_eq!(
            substitute(sql, &params),
            "SELECT * FROM bookings WHERE user_id = 'o''brien' AND listing_id = 'R1'"
        );
    }

    #[test]
    fn bound_values_are_not_rescanned() {
        let params = vec![Some("R1".to_string()), Some("a$1".to_string())];
        assert_eq!(
            substitute("SELECT * FROM bookings WHERE listing_id = $1 AND user_id = $2", &params),
            "SELECT * FROM bookings WHERE listing_id = 'R1' AND user_id = 'a$1'"
        );
        assert_eq!(substitute("SELECT $3, $, $0", &params), "SELECT $3, $, $0");
        assert_eq!(substitute("$1$2", &[None, Some("x".into())]), "NULL'x'");
    }
}

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
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldFormat, FieldInfo, QueryResponse,
    Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::{TlsAcceptor, process_socket};
use tokio::net::TcpStream;
use tracing::debug;

use crate::auth::{Role, SlotkeepAuthSource};
use crate::config::Config;
use crate::engine::{Engine, EngineError};
use crate::model::*;
use crate::observability::{self, command_label};
use crate::sql::{self, Command, SqlError};

pub struct SlotkeepHandler {
    engine: Arc<Engine>,
    public_user: String,
    query_parser: Arc<SlotkeepQueryParser>,
}

impl SlotkeepHandler {
    pub fn new(engine: Arc<Engine>, public_user: String) -> Self {
        Self {
            engine,
            public_user,
            query_parser: Arc::new(SlotkeepQueryParser),
        }
    }

    fn role<C: ClientInfo>(&self, client: &C) -> Role {
        let user = client.metadata().get("user").map(String::as_str);
        Role::for_user(user, &self.public_user)
    }

    /// Parse, authorize, execute and record one statement.
    async fn run(&self, role: Role, sql: &str) -> PgWireResult<Response> {
        let cmd = sql::parse_sql(sql).map_err(sql_err)?;
        let label = command_label(&cmd);
        if role == Role::Public && !cmd.is_public() {
            debug!(command = label, "statement refused to public session");
            metrics::counter!(observability::PERMISSION_DENIED_TOTAL, "command" => label).increment(1);
            return Err(user_error("42501", format!("{label} requires a staff session")));
        }

        let started = Instant::now();
        let result = self.execute_command(role, cmd).await;
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        result.map_err(engine_err)
    }

    async fn execute_command(&self, role: Role, cmd: Command) -> Result<Response, EngineError> {
        let engine = &self.engine;
        match cmd {
            Command::InsertWorkspace { id, name, timezone } => {
                engine.create_workspace(id, &name, &timezone).await?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::UpdateWorkspace { id, patch } => {
                engine.update_workspace(id, patch).await?;
                Ok(Response::Execution(Tag::new("UPDATE").with_rows(1)))
            }
            Command::SelectWorkspace { id } => {
                let found: Vec<_> = engine.get_workspace(&id).into_iter().collect();
                Ok(rows(workspace_schema(), &found, encode_workspace))
            }
            Command::InsertServiceType {
                id,
                workspace_id,
                name,
                duration_minutes,
                location,
                description,
            } => {
                engine
                    .create_service_type(id, workspace_id, &name, duration_minutes, location, description)
                    .await?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::UpdateServiceType { id, patch } => {
                engine.update_service_type(id, patch).await?;
                Ok(Response::Execution(Tag::new("UPDATE").with_rows(1)))
            }
            Command::SelectServiceTypes { workspace_id } => {
                let services = engine.list_service_types(workspace_id).await?;
                Ok(rows(service_type_schema(), &services, encode_service_type))
            }
            Command::InsertRule {
                id,
                service_type_id,
                day_of_week,
                start_time,
                end_time,
                resource,
            } => {
                engine
                    .add_rule(id, service_type_id, day_of_week, start_time, end_time, resource)
                    .await?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::DeleteRule { id } => {
                engine.remove_rule(id).await?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::SelectRules { service_type_id } => {
                let rules = engine.get_rules(service_type_id).await?;
                Ok(rows(rule_schema(), &rules, encode_rule))
            }
            Command::InsertBooking {
                id,
                workspace_id,
                service_type_id,
                scheduled_at,
                contact,
                notes,
                status,
            } => {
                let mut request = BookingRequest::new(workspace_id, service_type_id, scheduled_at, contact).with_id(id);
                request.notes = notes;
                match role {
                    Role::Staff => request = request.by_staff(status.unwrap_or(BookingStatus::Pending)),
                    Role::Public => request.initial_status = status.unwrap_or(BookingStatus::Pending),
                }
                let booking = engine.create_booking(request).await?;
                Ok(rows(booking_schema(), &[booking], encode_booking))
            }
            Command::UpdateBookingStatus { id, status } => {
                let booking = engine.update_booking_status(id, status).await?;
                Ok(rows(booking_schema(), &[booking], encode_booking))
            }
            Command::SelectBooking { id } => {
                let booking = engine.get_booking(id).await?;
                Ok(rows(booking_schema(), &[booking], encode_booking))
            }
            Command::SelectBookings { workspace_id, filter } => {
                let bookings = engine.list_bookings(workspace_id, &filter).await?;
                Ok(rows(booking_schema(), &bookings, encode_booking))
            }
            Command::SelectContact { id } => {
                let found: Vec<_> = engine.get_contact(&id).into_iter().collect();
                Ok(rows(contact_schema(), &found, encode_contact))
            }
            Command::SelectAvailability {
                workspace_id,
                service_type_id,
                date,
            } => {
                let slots = engine.available_slots(workspace_id, service_type_id, date).await?;
                let timezone = engine
                    .get_workspace(&workspace_id)
                    .map(|w| w.timezone)
                    .unwrap_or(chrono_tz::UTC);
                let service = service_type_id.to_string();
                Ok(rows(availability_schema(), &slots, |encoder, slot| {
                    encoder.encode_field(&service)?;
                    encoder.encode_field(&rfc3339(slot.start))?;
                    encoder.encode_field(&rfc3339(slot.end))?;
                    encoder.encode_field(&rfc3339_in(slot.start, timezone))?;
                    Ok(())
                }))
            }
        }
    }
}

// ── Result sets ──────────────────────────────────────────────────

fn rows<T>(
    schema: Vec<FieldInfo>,
    items: &[T],
    encode: impl Fn(&mut DataRowEncoder, &T) -> PgWireResult<()>,
) -> Response {
    let schema = Arc::new(schema);
    let rows: Vec<PgWireResult<_>> = items
        .iter()
        .map(|item| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encode(&mut encoder, item)?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn workspace_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("name", Type::VARCHAR),
        field("timezone", Type::VARCHAR),
        field("active", Type::BOOL),
    ]
}

fn encode_workspace(encoder: &mut DataRowEncoder, w: &Workspace) -> PgWireResult<()> {
    encoder.encode_field(&w.id.to_string())?;
    encoder.encode_field(&w.name)?;
    encoder.encode_field(&w.timezone.name().to_string())?;
    encoder.encode_field(&w.active)?;
    Ok(())
}

fn service_type_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("workspace_id", Type::VARCHAR),
        field("name", Type::VARCHAR),
        field("duration_minutes", Type::INT4),
        field("location", Type::VARCHAR),
        field("description", Type::VARCHAR),
        field("active", Type::BOOL),
    ]
}

fn encode_service_type(encoder: &mut DataRowEncoder, s: &ServiceType) -> PgWireResult<()> {
    encoder.encode_field(&s.id.to_string())?;
    encoder.encode_field(&s.workspace_id.to_string())?;
    encoder.encode_field(&s.name)?;
    encoder.encode_field(&(s.duration_minutes as i32))?;
    encoder.encode_field(&s.location)?;
    encoder.encode_field(&s.description)?;
    encoder.encode_field(&s.active)?;
    Ok(())
}

fn rule_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("service_type_id", Type::VARCHAR),
        field("day_of_week", Type::INT2),
        field("start_time", Type::VARCHAR),
        field("end_time", Type::VARCHAR),
        field("resource", Type::VARCHAR),
    ]
}

fn encode_rule(encoder: &mut DataRowEncoder, r: &AvailabilityRule) -> PgWireResult<()> {
    encoder.encode_field(&r.id.to_string())?;
    encoder.encode_field(&r.service_type_id.to_string())?;
    encoder.encode_field(&i16::from(r.day_of_week))?;
    encoder.encode_field(&r.start_time.format("%H:%M").to_string())?;
    encoder.encode_field(&r.end_time.format("%H:%M").to_string())?;
    encoder.encode_field(&r.resource)?;
    Ok(())
}

fn booking_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("workspace_id", Type::VARCHAR),
        field("service_type_id", Type::VARCHAR),
        field("contact_id", Type::VARCHAR),
        field("scheduled_at", Type::VARCHAR),
        field("ends_at", Type::VARCHAR),
        field("duration_minutes", Type::INT4),
        field("status", Type::VARCHAR),
        field("notes", Type::VARCHAR),
        field("created_at", Type::VARCHAR),
        field("updated_at", Type::VARCHAR),
    ]
}

fn encode_booking(encoder: &mut DataRowEncoder, b: &Booking) -> PgWireResult<()> {
    encoder.encode_field(&b.id.to_string())?;
    encoder.encode_field(&b.workspace_id.to_string())?;
    encoder.encode_field(&b.service_type_id.to_string())?;
    encoder.encode_field(&b.contact_id.to_string())?;
    encoder.encode_field(&rfc3339(b.scheduled_at))?;
    encoder.encode_field(&rfc3339(b.ends_at()))?;
    encoder.encode_field(&(b.duration_minutes as i32))?;
    encoder.encode_field(&b.status.as_str().to_string())?;
    encoder.encode_field(&b.notes)?;
    encoder.encode_field(&rfc3339(b.created_at))?;
    encoder.encode_field(&rfc3339(b.updated_at))?;
    Ok(())
}

fn contact_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("workspace_id", Type::VARCHAR),
        field("name", Type::VARCHAR),
        field("email", Type::VARCHAR),
        field("phone", Type::VARCHAR),
    ]
}

fn encode_contact(encoder: &mut DataRowEncoder, c: &Contact) -> PgWireResult<()> {
    encoder.encode_field(&c.id.to_string())?;
    encoder.encode_field(&c.workspace_id.to_string())?;
    encoder.encode_field(&c.name)?;
    encoder.encode_field(&c.email)?;
    encoder.encode_field(&c.phone)?;
    Ok(())
}

fn availability_schema() -> Vec<FieldInfo> {
    vec![
        field("service_type_id", Type::VARCHAR),
        field("start", Type::VARCHAR),
        field("end", Type::VARCHAR),
        field("local_start", Type::VARCHAR),
    ]
}

/// Result columns a statement will produce, judged from its text alone so it
/// works before parameters are bound.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    let words: Vec<String> = sql
        .split(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .filter(|w| !w.is_empty())
        .map(str::to_ascii_lowercase)
        .collect();
    let Some(verb) = words.first() else {
        return vec![];
    };
    let table = match verb.as_str() {
        "update" => words.get(1),
        "select" => words.iter().position(|w| w == "from").and_then(|i| words.get(i + 1)),
        "insert" => words.iter().position(|w| w == "into").and_then(|i| words.get(i + 1)),
        _ => None,
    };
    match (verb.as_str(), table.map(String::as_str)) {
        ("select", Some("workspaces")) => workspace_schema(),
        ("select", Some("service_types")) => service_type_schema(),
        ("select", Some("availability_rules")) => rule_schema(),
        ("select", Some("availability")) => availability_schema(),
        ("select", Some("contacts")) => contact_schema(),
        ("select" | "insert" | "update", Some("bookings")) => booking_schema(),
        _ => vec![],
    }
}

#[async_trait]
impl SimpleQueryHandler for SlotkeepHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let role = self.role(client);
        Ok(vec![self.run(role, query).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct SlotkeepQueryParser;

#[async_trait]
impl QueryParser for SlotkeepQueryParser {
    type Statement = String;

    async fn parse_sql<C>(&self, _client: &C, sql: &str, _types: &[Option<Type>]) -> PgWireResult<String>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        Ok(sql.to_string())
    }

    fn get_parameter_types(&self, stmt: &String) -> PgWireResult<Vec<Type>> {
        Ok(vec![Type::VARCHAR; count_params(stmt)])
    }

    fn get_result_schema(&self, stmt: &String, _column_format: Option<&Format>) -> PgWireResult<Vec<FieldInfo>> {
        Ok(result_schema(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for SlotkeepHandler {
    type Statement = String;
    type QueryParser = SlotkeepQueryParser;

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
        let role = self.role(client);
        let sql = substitute_params(portal);
        self.run(role, &sql).await
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
        Ok(DescribeStatementResponse::new(param_types, result_schema(&target.statement)))
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
        Ok(DescribePortalResponse::new(result_schema(&target.statement.statement)))
    }
}

/// A `$N` placeholder outside any quoted literal: its byte range and `N`.
struct Placeholder {
    start: usize,
    end: usize,
    index: usize,
}

/// Walk `sql` once, yielding each placeholder that sits outside a `'...'`
/// literal. A doubled `''` inside a literal toggles twice and stays quoted.
fn placeholders(sql: &str) -> Vec<Placeholder> {
    let bytes = sql.as_bytes();
    let mut found = Vec::new();
    let mut quoted = false;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\'' => quoted = !quoted,
            b'$' if !quoted => {
                let digits = i + 1;
                let mut end = digits;
                while end < bytes.len() && bytes[end].is_ascii_digit() {
                    end += 1;
                }
                if let Ok(index) = sql[digits..end].parse::<usize>() {
                    found.push(Placeholder { start: i, end, index });
                    i = end;
                    continue;
                }
            }
            _ => {}
        }
        i += 1;
    }
    found
}

/// Count the highest $N parameter placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    placeholders(sql).iter().map(|p| p.index).max().unwrap_or(0)
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

fn substitute(sql: &str, params: &[Option<String>]) -> String {
    let mut result = String::with_capacity(sql.len());
    let mut copied = 0;
    for p in placeholders(sql) {
        let Some(param) = p.index.checked_sub(1).and_then(|i| params.get(i)) else {
            continue;
        };
        result.push_str(&sql[copied..p.start]);
        match param {
            Some(text) => {
                result.push('\'');
                result.push_str(&text.replace('\'', "''"));
                result.push('\'');
            }
            None => result.push_str("NULL"),
        }
        copied = p.end;
    }
    result.push_str(&sql[copied..]);
    result
}

// ── Factory ──────────────────────────────────────────────────────

pub struct SlotkeepFactory {
    handler: Arc<SlotkeepHandler>,
    auth_handler: Arc<CleartextPasswordAuthStartupHandler<SlotkeepAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl SlotkeepFactory {
    pub fn new(engine: Arc<Engine>, config: &Config) -> Self {
        let auth_source = SlotkeepAuthSource::new(
            config.staff_password.clone(),
            config.public_user.clone(),
            config.public_password.clone(),
        );
        Self {
            handler: Arc::new(SlotkeepHandler::new(engine, config.public_user.clone())),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                DefaultServerParameterProvider::default(),
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for SlotkeepFactory {
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

/// Serve one client socket until it disconnects.
pub async fn process_connection(
    socket: TcpStream,
    factory: Arc<SlotkeepFactory>,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new("ERROR".into(), code.into(), message)))
}

/// SQLSTATE for each engine outcome, so clients can branch without parsing text.
pub fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::Validation(_) => "22023",
        EngineError::SlotUnavailable { .. } => "23P01",
        EngineError::InvalidTransition { .. } => "55000",
        EngineError::Timeout(_) => "55P03",
        EngineError::NotFound(_) => "P0002",
        EngineError::AlreadyExists(_) => "23505",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::WalError(_) => "58030",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    user_error(sqlstate(&e), e.to_string())
}

fn sql_err(e: SqlError) -> PgWireError {
    let code = match &e {
        SqlError::UnknownTable(_) => "42P01",
        SqlError::UnknownColumn(..) => "42703",
        SqlError::Unsupported(_) => "0A000",
        SqlError::TooLong => "54000",
        _ => "42601",
    };
    user_error(code, e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_highest_placeholder() {
        assert_eq!(count_params("SELECT * FROM bookings WHERE id = $2 AND workspace_id = $1"), 2);
        assert_eq!(count_params("SELECT * FROM workspaces"), 0);
        assert_eq!(count_params("SELECT '$'"), 0);
    }

    #[test]
    fn substitutes_quoted_and_null() {
        let sql = substitute(
            "INSERT INTO bookings VALUES ($1, $2, $10)",
            &[
                None,
                Some("O'Brien".into()),
                None,
                None,
                None,
                None,
                None,
                None,
                None,
                Some("x".into()),
            ],
        );
        assert_eq!(sql, "INSERT INTO bookings VALUES (NULL, 'O''Brien', 'x')");
    }

    #[test]
    fn substituted_values_are_not_rescanned() {
        let sql = substitute(
            "INSERT INTO t VALUES ($1, $2)",
            &[Some("abc".into()), Some("call me at $1".into())],
        );
        assert_eq!(sql, "INSERT INTO t VALUES ('abc', 'call me at $1')");
    }

    #[test]
    fn placeholders_inside_literals_are_left_alone() {
        let sql = "UPDATE bookings SET status = $1 WHERE id = '$2 isn''t $3'";
        assert_eq!(count_params(sql), 1);
        assert_eq!(
            substitute(sql, &[Some("confirmed".into()), Some("x".into())]),
            "UPDATE bookings SET status = 'confirmed' WHERE id = '$2 isn''t $3'"
        );
        // Out of range placeholders are kept as written.
        assert_eq!(substitute("SELECT $0, $4", &[None]), "SELECT $0, $4");
    }

    #[test]
    fn schema_by_statement() {
        assert_eq!(result_schema("SELECT * FROM availability WHERE x = $1").len(), 4);
        assert_eq!(result_schema("select * from availability_rules where service_type_id = $1").len(), 6);
        assert_eq!(result_schema("UPDATE bookings SET status = $1 WHERE id = $2").len(), 11);
        assert_eq!(result_schema("INSERT INTO bookings VALUES ($1)").len(), 11);
        assert!(result_schema("INSERT INTO workspaces VALUES ($1, $2)").is_empty());
        assert!(result_schema("DELETE FROM availability_rules WHERE id = $1").is_empty());
    }

    #[test]
    fn sqlstate_per_outcome() {
        use crate::engine::Unavailable;
        use ulid::Ulid;
        assert_eq!(
            sqlstate(&EngineError::SlotUnavailable {
                service_type_id: Ulid::nil(),
                requested_at: 0,
                reason: Unavailable::NotOffered,
            }),
            "23P01"
        );
        assert_eq!(sqlstate(&EngineError::Timeout(std::time::Duration::ZERO)), "55P03");
        assert_eq!(sqlstate(&EngineError::invalid("email", "bad")), "22023");
    }
}

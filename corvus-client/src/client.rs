//! High-level database API.

use crate::connection::{Connection, ConnectionConfig};
use crate::error::ClientError;
use corvus_protocol::operations::{
    Command, DbClose, DbOpen, DbReload, DbType, RecordCreate, RecordDelete, RecordLoad,
    RecordUpdate,
};
use corvus_protocol::serialize::encode_record;
use corvus_protocol::{
    resolver, Cluster, CommandResult, Document, Payload, PushEvent, PushKind, RecordId,
    RequestError, SharedRecord, Value, NO_SESSION,
};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Database access configuration.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub name: String,
    pub username: String,
    pub password: String,
    pub db_type: DbType,
    pub connection: ConnectionConfig,
}

impl DatabaseConfig {
    pub fn new(addr: SocketAddr, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            username: "admin".to_string(),
            password: String::new(),
            db_type: DbType::Document,
            connection: ConnectionConfig::new(addr),
        }
    }

    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.username = username.into();
        self.password = password.into();
        self
    }

    pub fn with_db_type(mut self, db_type: DbType) -> Self {
        self.db_type = db_type;
        self
    }

    pub fn with_connection(mut self, connection: ConnectionConfig) -> Self {
        self.connection = connection;
        self
    }

    fn validate(&self) -> Result<(), ClientError> {
        if self.name.is_empty() {
            return Err(ClientError::Config("database name is empty".to_string()));
        }
        if self.username.is_empty() {
            return Err(ClientError::Config("username is empty".to_string()));
        }
        Ok(())
    }
}

/// Normalized result of a command or query.
#[derive(Debug)]
pub enum CommandOutcome {
    /// The command produced nothing.
    None,
    /// Record results, resolved against any preloaded companions.
    Records(Vec<SharedRecord>),
    /// A scalar result, in its textual form.
    Scalar(String),
}

/// An open session against one database.
///
/// Owns the connection, its background read loop and a push listener
/// that keeps the cluster topology cache current.
pub struct Database {
    conn: Arc<Connection>,
    session: AtomicI32,
    clusters: Arc<parking_lot::RwLock<Vec<Cluster>>>,
    read_task: JoinHandle<()>,
    push_task: JoinHandle<()>,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("session", &self.session)
            .finish_non_exhaustive()
    }
}

impl Database {
    /// Connects, authenticates and opens the named database.
    pub async fn open(config: DatabaseConfig) -> Result<Database, ClientError> {
        config.validate()?;

        let conn = Arc::new(Connection::new(config.connection.clone()));
        conn.connect().await?;

        let read_task = {
            let conn = conn.clone();
            tokio::spawn(async move {
                if let Err(e) = conn.read_loop().await {
                    tracing::debug!(error = %e, "read loop ended");
                }
            })
        };

        let clusters = Arc::new(parking_lot::RwLock::new(Vec::new()));
        let push_task = tokio::spawn(refresh_on_push(conn.subscribe_pushes(), clusters.clone()));

        let db = Database {
            conn,
            session: AtomicI32::new(NO_SESSION),
            clusters,
            read_task,
            push_task,
        };

        let payload = db
            .conn
            .send(DbOpen {
                database: config.name.clone(),
                username: config.username.clone(),
                password: config.password.clone(),
                db_type: config.db_type,
            })
            .await;
        let open = match payload {
            Ok(Payload::Open(open)) => open,
            Ok(other) => return Err(unexpected(&db, other).await),
            Err(e) => {
                db.abandon().await;
                return Err(e);
            }
        };

        tracing::debug!(
            session = open.session,
            clusters = open.clusters.len(),
            server = open.server_version.as_deref().unwrap_or("unknown"),
            "database open"
        );
        db.session.store(open.session, Ordering::SeqCst);
        *db.clusters.write() = open.clusters;
        Ok(db)
    }

    fn session(&self) -> i32 {
        self.session.load(Ordering::SeqCst)
    }

    /// The cached cluster topology.
    pub fn clusters(&self) -> Vec<Cluster> {
        self.clusters.read().clone()
    }

    /// Number of requests currently awaiting a response.
    pub fn pending_count(&self) -> usize {
        self.conn.pending_count()
    }

    /// Subscribes to server pushes.
    pub fn subscribe_pushes(&self) -> broadcast::Receiver<PushEvent> {
        self.conn.subscribe_pushes()
    }

    fn cluster_by_name(&self, name: &str) -> Option<i16> {
        self.clusters
            .read()
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(name))
            .map(|c| c.id)
    }

    /// Loads one record. A fetch plan (e.g. `*:-1`) preloads linked
    /// records, which are resolved into the returned graph.
    pub async fn load(
        &self,
        rid: RecordId,
        fetch_plan: &str,
    ) -> Result<SharedRecord, ClientError> {
        let payload = self
            .conn
            .send(RecordLoad {
                session: self.session(),
                rid,
                fetch_plan: fetch_plan.to_string(),
            })
            .await?;
        let set = match payload {
            Payload::Records(set) => set,
            other => return Err(self.unexpected_payload(other)),
        };

        match set.primary {
            Some(primary) => Ok(resolver::resolve(primary, set.companions)),
            None => Err(ClientError::Request(RequestError::new(
                "RecordNotFound",
                format!("no record at {rid}"),
            ))),
        }
    }

    /// Creates the document as a new record.
    ///
    /// The target cluster comes from an explicit record id on the
    /// document, or from its class via the cluster cache. The
    /// server-assigned record id and version are written back.
    pub async fn create(&self, doc: &mut Document) -> Result<RecordId, ClientError> {
        let cluster = match doc.rid() {
            Some(rid) => rid.cluster,
            None => {
                let class = doc.class().ok_or_else(|| {
                    ClientError::Operation(
                        "create needs a record id or a class to pick a cluster".to_string(),
                    )
                })?;
                self.cluster_by_name(class).ok_or_else(|| {
                    ClientError::Operation(format!("no cluster for class {class:?}"))
                })?
            }
        };

        let payload = self
            .conn
            .send(RecordCreate {
                session: self.session(),
                cluster,
                content: encode_record(doc),
            })
            .await?;
        match payload {
            Payload::Created { position, version } => {
                let rid = RecordId::new(cluster, position);
                doc.set_rid(rid);
                doc.set_version(version);
                Ok(rid)
            }
            other => Err(self.unexpected_payload(other)),
        }
    }

    /// Replaces the record's stored content with the document.
    ///
    /// The document's version, when it carries one, is checked by the
    /// server; the new version is written back.
    pub async fn update(&self, doc: &mut Document) -> Result<(), ClientError> {
        let rid = doc
            .rid()
            .ok_or_else(|| ClientError::Operation("update needs a record id".to_string()))?;

        let payload = self
            .conn
            .send(RecordUpdate {
                session: self.session(),
                rid,
                content: encode_record(doc),
                version: doc.version().unwrap_or(-1),
            })
            .await?;
        match payload {
            Payload::Updated { version } => {
                doc.set_version(version);
                Ok(())
            }
            other => Err(self.unexpected_payload(other)),
        }
    }

    /// Deletes the record. Returns whether the server found it.
    pub async fn delete(&self, doc: &Document) -> Result<bool, ClientError> {
        let rid = doc
            .rid()
            .ok_or_else(|| ClientError::Operation("delete needs a record id".to_string()))?;

        let payload = self
            .conn
            .send(RecordDelete {
                session: self.session(),
                rid,
                version: doc.version().unwrap_or(-1),
            })
            .await?;
        match payload {
            Payload::Deleted { success } => Ok(success),
            other => Err(self.unexpected_payload(other)),
        }
    }

    /// Runs an idempotent query. Record results are resolved against
    /// the query's preloaded companions.
    pub async fn query(
        &self,
        text: impl Into<String>,
        fetch_plan: &str,
    ) -> Result<Vec<SharedRecord>, ClientError> {
        let outcome = self
            .run_command(Command::query(self.session(), text, fetch_plan))
            .await?;
        match outcome {
            CommandOutcome::Records(records) => Ok(records),
            CommandOutcome::None => Ok(Vec::new()),
            CommandOutcome::Scalar(s) => Err(ClientError::Operation(format!(
                "query produced a scalar ({s:?}), not records"
            ))),
        }
    }

    /// Runs an arbitrary statement.
    pub async fn command(&self, text: impl Into<String>) -> Result<CommandOutcome, ClientError> {
        self.run_command(Command::statement(self.session(), text))
            .await
    }

    async fn run_command(&self, op: Command) -> Result<CommandOutcome, ClientError> {
        let payload = self.conn.send(op).await?;
        let response = match payload {
            Payload::Command(response) => response,
            other => return Err(self.unexpected_payload(other)),
        };

        Ok(match response.result {
            CommandResult::None => CommandOutcome::None,
            CommandResult::Record(doc) => {
                CommandOutcome::Records(resolver::resolve_all(vec![doc], response.preloaded))
            }
            CommandResult::Collection(docs) => {
                CommandOutcome::Records(resolver::resolve_all(docs, response.preloaded))
            }
            CommandResult::Scalar(s) => CommandOutcome::Scalar(s),
        })
    }

    /// Refreshes the cluster topology cache from the server.
    pub async fn reload(&self) -> Result<(), ClientError> {
        let payload = self.conn.send(DbReload { session: self.session() }).await?;
        match payload {
            Payload::Clusters(clusters) => {
                *self.clusters.write() = clusters;
                Ok(())
            }
            other => Err(self.unexpected_payload(other)),
        }
    }

    /// Ends the session and tears the connection down.
    pub async fn close(self) -> Result<(), ClientError> {
        self.conn
            .close(DbClose {
                session: self.session(),
            })
            .await?;
        self.read_task.abort();
        self.push_task.abort();
        Ok(())
    }

    fn unexpected_payload(&self, payload: Payload) -> ClientError {
        tracing::warn!(?payload, "response payload does not match the operation");
        ClientError::Operation("response payload does not match the operation".to_string())
    }

    async fn abandon(&self) {
        self.conn
            .close(DbClose {
                session: NO_SESSION,
            })
            .await
            .ok();
        self.read_task.abort();
        self.push_task.abort();
    }
}

async fn unexpected(db: &Database, payload: Payload) -> ClientError {
    let err = db.unexpected_payload(payload);
    db.abandon().await;
    err
}

/// Applies cluster-config pushes to the topology cache until the
/// channel closes. A lagged receiver skips the missed events and keeps
/// listening; every config push carries the full topology.
async fn refresh_on_push(
    mut pushes: broadcast::Receiver<PushEvent>,
    clusters: Arc<parking_lot::RwLock<Vec<Cluster>>>,
) {
    loop {
        match pushes.recv().await {
            Ok(event) => match event.kind {
                PushKind::ClusterConfig => {
                    let refreshed = clusters_from_document(&event.data);
                    tracing::debug!(count = refreshed.len(), "cluster config push");
                    *clusters.write() = refreshed;
                }
            },
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "push listener lagged");
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

/// Extracts a cluster list from a cluster-config push payload: a
/// `clusters` field holding embedded documents with `name` and `id`.
fn clusters_from_document(doc: &Document) -> Vec<Cluster> {
    let Some(Value::List(items)) = doc.get("clusters") else {
        return Vec::new();
    };

    items
        .iter()
        .filter_map(|item| {
            let entry = item.as_embedded()?;
            let name = entry.get("name")?.as_str()?.to_string();
            let id = entry.get("id")?.as_int()?;
            Some(Cluster {
                name,
                id: id as i16,
            })
        })
        .collect()
}

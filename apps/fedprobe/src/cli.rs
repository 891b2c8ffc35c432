use std::fmt::Display;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use federation_sdk::{FederationClient, FederationClientConfig, HomeserverClient, RequestSigner};
use serde::Serialize;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, warn};

use crate::adapters::{SignedFederation, StateDumpSource};
use crate::aggregate::{
    DelegationReport, DeviceReport, EventListReport, EventReport, FindEventReport, HostReport,
    KeyReport, VersionReport,
};
use crate::backwalk::BackwalkEngine;
use crate::backwalk::control::{ControlRegistry, ControlSignal, SessionId};
use crate::config::AppConfig;
use crate::delegation::DelegationResolver;
use crate::delegation::dns::HickoryDnsResolver;
use crate::dispatch::DispatchReport;
use crate::error::{FedProbeError, InputError};
use crate::events::FederationStateSource;
use crate::hosts::{HostOrderingResolver, MembershipSource};
use crate::probe::{FederationProber, ProbeFailure, ProbeKind, ProbeOutcome, ProbePayload};
use crate::server_name::ServerName;
use crate::targets::{RoomDirectory, TargetSpec, expand_targets, resolve_room};

pub const DELEGATION_SUMMARY: &str = "\
How a server name is turned into a federation endpoint:

1. literal-ip: the host is an IP literal. Connect to it on the given port,
   or 8448.
2. dns-with-port: the name carries a port. Resolve the hostname (A/AAAA)
   and connect on that port.
3. well-known: fetch https://<hostname>/.well-known/matrix/server. If it
   names a delegated server:
   3a. delegated literal-ip: connect to it on its port, or 8448.
   3b. delegated dns-with-port: resolve it and connect on its port.
   3c. SRV _matrix-fed._tcp.<delegated>
   3d. SRV _matrix._tcp.<delegated> (deprecated)
   3e. otherwise resolve the delegated host and use port 8448.
   TLS and Host use the delegated name.
4. SRV _matrix-fed._tcp.<hostname>
5. SRV _matrix._tcp.<hostname> (deprecated)
6. otherwise resolve the hostname and use port 8448.

SRV targets must resolve without CNAMEs; TLS uses the original name.";

#[derive(Parser, Debug)]
#[command(name = "fedprobe")]
#[command(about = "Matrix federation reachability diagnoser", version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Print reports as JSON
    #[arg(long, global = true)]
    pub json: bool,

    /// Maximum probes in flight (overrides FEDPROBE_MAX_IN_FLIGHT)
    #[arg(long, global = true)]
    pub max_in_flight: Option<usize>,

    /// Per-request timeout in milliseconds (overrides FEDPROBE_REQUEST_TIMEOUT_MS)
    #[arg(long, global = true)]
    pub timeout_ms: Option<u64>,

    /// Budget for one whole probe, delegation included (overrides
    /// FEDPROBE_PROBE_TIMEOUT_MS; defaults to the request timeout)
    #[arg(long, global = true)]
    pub probe_timeout_ms: Option<u64>,

    /// Homeserver used for room-scoped targets and room walks
    #[arg(long, global = true, env = "FEDPROBE_HOMESERVER_URL")]
    pub homeserver_url: Option<String>,

    /// Access token for --homeserver-url
    #[arg(long, global = true, env = "FEDPROBE_ACCESS_TOKEN", hide_env_values = true)]
    pub access_token: Option<String>,

    /// Server name that signed federation requests come from
    #[arg(long, global = true, env = "FEDPROBE_ORIGIN_SERVER")]
    pub origin_server: Option<String>,

    /// Signing key file of --origin-server (`ed25519 <version> <seed>`)
    #[arg(long, global = true, env = "FEDPROBE_SIGNING_KEY_PATH")]
    pub signing_key: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Diagnose how one or more servers resolve and whether they answer
    Delegation {
        /// Server name, @user:server, !room:server or #alias:server
        target: String,
    },

    /// Ask servers which software and version they run
    Version { target: String },

    /// Fetch servers' published signing keys
    ServerKeys {
        target: String,

        /// Print the raw key response (single server only)
        #[arg(long)]
        raw: bool,
    },

    /// Ask a notary for servers' signing keys
    NotaryKeys {
        target: String,

        /// Notary to ask (defaults to each target itself)
        #[arg(long)]
        notary: Option<String>,

        /// Print the raw notary response (single server only)
        #[arg(long)]
        raw: bool,
    },

    /// Walk a room's history forward then backward and count what was found
    RoomWalk {
        /// Room id or alias
        room: String,

        /// Events requested per page
        #[arg(long, default_value_t = 1000)]
        per_iteration: u32,

        /// Known room depth, shown as progress denominator
        #[arg(long)]
        depth: Option<u64>,
    },

    /// Order a room's hosts by earliest join depth
    RoomHosts {
        /// Room id or alias; without --state-file its state is fetched live
        #[arg(long)]
        room: Option<String>,

        /// JSON file: a federation /state response or an array of state events
        #[arg(long)]
        state_file: Option<PathBuf>,

        /// Use the room state as of this event
        #[arg(long)]
        event: Option<String>,

        /// Server to fetch live state from (defaults to the origin server)
        #[arg(long)]
        server: Option<String>,
    },

    /// Ask every host in a room whether it has an event
    FindEvent {
        event_id: String,

        /// Room id or alias the event belongs to
        room: String,

        /// Server whose room state lists the hosts (defaults to the origin server)
        #[arg(long)]
        server: Option<String>,
    },

    /// Fetch one event over federation
    Event {
        event_id: String,

        /// Server to ask (defaults to the origin server)
        #[arg(long)]
        server: Option<String>,

        /// Print the PDU exactly as served
        #[arg(long)]
        raw: bool,
    },

    /// List a room's state at an event
    State {
        /// Room id or alias
        room: String,

        /// Event to take the state at (defaults to the server's latest)
        #[arg(long)]
        event: Option<String>,

        #[arg(long)]
        server: Option<String>,
    },

    /// Fetch the events preceding an event
    Backfill {
        /// Room id or alias
        room: String,

        /// Event to page back from (defaults to the server's latest)
        #[arg(long)]
        event: Option<String>,

        #[arg(long, default_value_t = 10)]
        limit: u32,

        #[arg(long)]
        server: Option<String>,
    },

    /// List an event's auth chain
    EventAuth {
        /// Room id or alias
        room: String,

        event_id: String,

        #[arg(long)]
        server: Option<String>,
    },

    /// List a user's devices as their own server reports them
    UserDevices { user_id: String },

    /// Explain the delegation algorithm
    Summary,
}

impl Cli {
    pub fn apply_overrides(&self, config: &mut AppConfig) {
        if let Some(max) = self.max_in_flight.filter(|max| *max > 0) {
            config.max_in_flight = max;
        }
        if let Some(timeout) = self.timeout_ms.filter(|ms| *ms > 0) {
            config.request_timeout_ms = timeout;
        }
        if let Some(timeout) = self.probe_timeout_ms.filter(|ms| *ms > 0) {
            config.probe_timeout_ms = Some(timeout);
        }
        if self.homeserver_url.is_some() {
            config.homeserver_url = self.homeserver_url.clone();
        }
        if self.access_token.is_some() {
            config.access_token = self.access_token.clone();
        }
        if self.origin_server.is_some() {
            config.origin_server = self.origin_server.clone();
        }
        if self.signing_key.is_some() {
            config.signing_key_path = self.signing_key.clone();
        }
    }
}

/// Everything a command needs, built once from configuration.
pub struct App {
    config: AppConfig,
    prober: FederationProber,
    /// Set only when requests can be signed as this server.
    origin: Option<ServerName>,
    homeserver: Option<HomeserverClient>,
    registry: Arc<ControlRegistry>,
}

impl App {
    pub fn new(config: AppConfig) -> Result<Self> {
        let client = Arc::new(FederationClient::new(FederationClientConfig {
            request_timeout: config.request_timeout(),
            ..FederationClientConfig::default()
        })?);
        let dns = HickoryDnsResolver::from_system_conf().context("loading system DNS config")?;
        let resolver = DelegationResolver::new(Arc::new(dns), client.clone());
        let mut prober = FederationProber::new(resolver, client.clone());
        let mut origin = None;
        match (&config.origin_server, &config.signing_key_path) {
            (Some(server), Some(path)) => {
                let contents = std::fs::read_to_string(path)
                    .with_context(|| format!("reading signing key {}", path.display()))?;
                let signer = RequestSigner::from_key_file(server.clone(), &contents)?;
                info!(
                    target = "fedprobe::cli",
                    origin = %server,
                    key_id = signer.key_id(),
                    "signing federation requests"
                );
                origin = Some(ServerName::parse(server)?);
                prober = prober.with_events(Arc::new(SignedFederation::new(client, signer)));
            }
            (None, None) => {}
            _ => warn!(
                target = "fedprobe::cli",
                "request signing needs both FEDPROBE_ORIGIN_SERVER and FEDPROBE_SIGNING_KEY_PATH"
            ),
        }
        let homeserver = match (&config.homeserver_url, &config.access_token) {
            (Some(url), Some(token)) => Some(
                HomeserverClient::new(url, token.clone(), config.request_timeout())
                    .context("building homeserver client")?,
            ),
            _ => None,
        };
        Ok(Self {
            config,
            prober,
            origin,
            homeserver,
            registry: Arc::new(ControlRegistry::new()),
        })
    }

    pub async fn run(&self, command: Commands, json: bool) -> Result<()> {
        match command {
            Commands::Summary => println!("{DELEGATION_SUMMARY}"),
            Commands::Delegation { target } => self.delegation(&target, json).await?,
            Commands::Version { target } => {
                let targets = self.targets(&target).await?;
                let report = self.probe(&targets, ProbeKind::Version).await;
                emit(&VersionReport::build(&targets, &report), json)?;
            }
            Commands::ServerKeys { target, raw } => {
                let targets = self.targets(&target).await?;
                let report = self.probe(&targets, ProbeKind::ServerKeys).await;
                if raw && print_raw(&targets, &report)? {
                    return Ok(());
                }
                emit(&KeyReport::build(&targets, &report), json)?;
            }
            Commands::NotaryKeys {
                target,
                notary,
                raw,
            } => {
                let notary = notary
                    .as_deref()
                    .map(ServerName::parse)
                    .transpose()?;
                let targets = self.targets(&target).await?;
                let report = self.probe(&targets, ProbeKind::NotaryKeys { notary }).await;
                if raw && print_raw(&targets, &report)? {
                    return Ok(());
                }
                emit(&KeyReport::build(&targets, &report), json)?;
            }
            Commands::RoomWalk {
                room,
                per_iteration,
                depth,
            } => self.room_walk(&room, per_iteration, depth, json).await?,
            Commands::RoomHosts {
                room,
                state_file,
                event,
                server,
            } => {
                let (source, room_id) = match state_file {
                    Some(path) => {
                        let source: Arc<dyn MembershipSource> = Arc::new(StateDumpSource::new(path));
                        (source, room.unwrap_or_else(|| "room".to_string()))
                    }
                    None => {
                        let room = room.ok_or(InputError::MissingIdentifier("--room or --state-file"))?;
                        let server = self.signing_server(server.as_deref())?;
                        let room_id = self.room_id(&room).await?;
                        let source: Arc<dyn MembershipSource> =
                            Arc::new(FederationStateSource::new(self.prober.clone(), server));
                        (source, room_id)
                    }
                };
                let hosts = HostOrderingResolver::new(source)
                    .ordered_hosts(&room_id, event.as_deref())
                    .await?;
                emit(&HostReport::build(&room_id, &hosts), json)?;
            }
            Commands::FindEvent {
                event_id,
                room,
                server,
            } => self.find_event(&event_id, &room, server.as_deref(), json).await?,
            Commands::Event {
                event_id,
                server,
                raw,
            } => {
                let server = self.signing_server(server.as_deref())?;
                let event = self
                    .prober
                    .fetch_event(&server, &event_id)
                    .await
                    .map_err(|failure| remote(&server, failure))?;
                if raw {
                    println!("{}", serde_json::to_string_pretty(&event.raw)?);
                } else {
                    let server = server.to_string();
                    emit(&EventReport { server, event }, json)?;
                }
            }
            Commands::State {
                room,
                event,
                server,
            } => self.state(&room, event, server.as_deref(), json).await?,
            Commands::Backfill {
                room,
                event,
                limit,
                server,
            } => {
                if limit == 0 {
                    return Err(InputError::InvalidParameter {
                        field: "limit",
                        reason: "must be at least 1".into(),
                    }
                    .into());
                }
                let server = self.signing_server(server.as_deref())?;
                let room_id = self.room_id(&room).await?;
                let anchor = self.anchor(&server, &room_id, event).await?;
                let events = self
                    .prober
                    .backfill(&server, &room_id, &anchor, limit)
                    .await
                    .map_err(|failure| remote(&server, failure))?;
                let heading = format!("Backfill of {room_id} from {anchor} on {server}");
                emit(&EventListReport::from_events(heading, &events), json)?;
            }
            Commands::EventAuth {
                room,
                event_id,
                server,
            } => {
                let server = self.signing_server(server.as_deref())?;
                let room_id = self.room_id(&room).await?;
                let chain = self
                    .prober
                    .event_auth(&server, &room_id, &event_id)
                    .await
                    .map_err(|failure| remote(&server, failure))?;
                let heading = format!("Auth chain of {event_id} on {server}");
                emit(&EventListReport::from_events(heading, &chain), json)?;
            }
            Commands::UserDevices { user_id } => {
                self.signing_server(None)?;
                let list = self.prober.user_devices(&user_id).await.map_err(|failure| {
                    FedProbeError::Federation {
                        server: user_id.clone(),
                        message: failure.to_string(),
                    }
                })?;
                emit(&DeviceReport { list }, json)?;
            }
        }
        Ok(())
    }

    /// `server`, or the origin server, as the side that answers signed
    /// requests. Fails when signing is not configured.
    fn signing_server(&self, server: Option<&str>) -> Result<ServerName, FedProbeError> {
        let Some(origin) = self.origin.as_ref().filter(|_| self.prober.can_sign()) else {
            return Err(FedProbeError::Config(
                "this command signs its requests; set FEDPROBE_ORIGIN_SERVER and FEDPROBE_SIGNING_KEY_PATH"
                    .into(),
            ));
        };
        match server {
            Some(server) => Ok(ServerName::parse(server)?),
            None => Ok(origin.clone()),
        }
    }

    async fn room_id(&self, room: &str) -> Result<String, FedProbeError> {
        let spec = TargetSpec::parse(room)?;
        resolve_room(&spec, self.directory()).await
    }

    /// `event`, or the newest event `server` has in the room.
    async fn anchor(
        &self,
        server: &ServerName,
        room_id: &str,
        event: Option<String>,
    ) -> Result<String, FedProbeError> {
        match event {
            Some(event_id) => Ok(event_id),
            None => self
                .prober
                .latest_event(server, room_id)
                .await
                .map_err(|failure| remote(server, failure)),
        }
    }

    fn directory(&self) -> Option<&dyn RoomDirectory> {
        self.homeserver
            .as_ref()
            .map(|client| client as &dyn RoomDirectory)
    }

    async fn targets(&self, target: &str) -> Result<Vec<ServerName>, FedProbeError> {
        let spec = TargetSpec::parse(target)?;
        let targets = expand_targets(&spec, self.directory(), self.config.max_servers).await?;
        info!(
            target = "fedprobe::cli",
            target_spec = %spec,
            servers = targets.len(),
            "targets expanded"
        );
        Ok(targets)
    }

    async fn delegation(&self, target: &str, json: bool) -> Result<()> {
        let targets = self.targets(target).await?;
        let prober = self.prober.clone();
        let (token, _interrupt) = interrupt_token();
        let report = self
            .config
            .dispatcher("delegation")
            .run_until(
                targets.clone(),
                move |server: ServerName| {
                    let prober = prober.clone();
                    async move { Ok::<_, ProbeFailure>(prober.diagnose(&server).await) }
                },
                token,
            )
            .await;
        emit(&DelegationReport::build(&targets, &report), json)
    }

    async fn probe(
        &self,
        targets: &[ServerName],
        kind: ProbeKind,
    ) -> DispatchReport<ServerName, ProbePayload> {
        let prober = self.prober.clone();
        let (token, _interrupt) = interrupt_token();
        self.config
            .dispatcher(kind.label())
            .run_until(
                targets.to_vec(),
                move |server: ServerName| {
                    let prober = prober.clone();
                    let kind = kind.clone();
                    async move { prober.probe_one(&server, &kind).await }
                },
                token,
            )
            .await
    }

    async fn find_event(
        &self,
        event_id: &str,
        room: &str,
        server: Option<&str>,
        json: bool,
    ) -> Result<()> {
        let server = self.signing_server(server)?;
        let room_id = self.room_id(room).await?;
        let hosts = HostOrderingResolver::new(Arc::new(FederationStateSource::new(
            self.prober.clone(),
            server,
        )))
        .ordered_hosts(&room_id, None)
        .await?;
        let servers: Vec<ServerName> = hosts
            .iter()
            .filter_map(|record| match ServerName::parse(&record.host) {
                Ok(name) => Some(name),
                Err(err) => {
                    warn!(target = "fedprobe::cli", host = %record.host, error = %err, "skipping host");
                    None
                }
            })
            .collect();
        if servers.len() > self.config.max_servers {
            return Err(InputError::TooManyTargets {
                count: servers.len(),
                max: self.config.max_servers,
            }
            .into());
        }
        info!(
            target = "fedprobe::cli",
            room_id = %room_id,
            event_id,
            servers = servers.len(),
            "asking room hosts for event"
        );
        let report = self
            .probe(
                &servers,
                ProbeKind::FindEvent {
                    event_id: event_id.to_string(),
                },
            )
            .await;
        emit(&FindEventReport::build(event_id, &servers, &report), json)
    }

    /// State ids first, then every state event fetched concurrently.
    async fn state(
        &self,
        room: &str,
        event: Option<String>,
        server: Option<&str>,
        json: bool,
    ) -> Result<()> {
        let server = self.signing_server(server)?;
        let room_id = self.room_id(room).await?;
        let anchor = self.anchor(&server, &room_id, event).await?;
        let ids = self
            .prober
            .state_ids(&server, &room_id, &anchor)
            .await
            .map_err(|failure| remote(&server, failure))?;

        let prober = self.prober.clone();
        let from = server.clone();
        let (token, _interrupt) = interrupt_token();
        let report = self
            .config
            .dispatcher("state")
            .run_until(
                ids.clone(),
                move |event_id: String| {
                    let prober = prober.clone();
                    let from = from.clone();
                    async move { prober.fetch_event(&from, &event_id).await }
                },
                token,
            )
            .await;
        let heading = format!("State of {room_id} at {anchor} on {server}");
        emit(&EventListReport::from_dispatch(heading, &ids, &report), json)
    }

    async fn room_walk(
        &self,
        room: &str,
        per_iteration: u32,
        depth: Option<u64>,
        json: bool,
    ) -> Result<()> {
        if per_iteration == 0 {
            return Err(InputError::InvalidParameter {
                field: "per-iteration",
                reason: "must be at least 1".into(),
            }
            .into());
        }
        let homeserver = self.homeserver.clone().ok_or_else(|| {
            FedProbeError::Config(
                "room-walk needs FEDPROBE_HOMESERVER_URL and FEDPROBE_ACCESS_TOKEN".into(),
            )
        })?;
        let room_id = self.room_id(room).await?;
        let depth = match (depth, &self.origin) {
            (Some(depth), _) => Some(depth),
            (None, Some(origin)) if self.prober.can_sign() => {
                match self.prober.room_depth(origin, &room_id).await {
                    Ok(depth) => u64::try_from(depth).ok(),
                    Err(failure) => {
                        warn!(
                            target = "fedprobe::cli",
                            room_id = %room_id,
                            error = %failure,
                            "room depth lookup failed; progress will have no total"
                        );
                        None
                    }
                }
            }
            (None, _) => None,
        };

        let engine = BackwalkEngine::new(
            Arc::new(homeserver),
            self.config.backwalk_policy(per_iteration),
        );
        let handle = engine.start(&self.registry, room_id, depth);
        let session = handle.session();

        let registry = self.registry.clone();
        let ctrl_c = tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!(target = "fedprobe::cli", session = %session, "interrupt: stopping room walk");
                request_stop(&registry, session);
            }
        });

        let mut progress = handle.progress();
        let printer = tokio::spawn(async move {
            while progress.changed().await.is_ok() {
                let snapshot = progress.borrow_and_update().clone();
                if !json {
                    eprintln!("{snapshot}");
                }
            }
        });

        let finished = handle.join().await?;
        ctrl_c.abort();
        let _ = printer.await;
        emit(&finished, json)
    }
}

/// Cancelled on Ctrl-C so batch commands still report partial results.
/// Dropping the guard cancels the token, which also ends the Ctrl-C
/// listener.
fn interrupt_token() -> (CancellationToken, DropGuard) {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = trigger.cancelled() => {}
            result = tokio::signal::ctrl_c() => {
                if result.is_ok() {
                    debug!(target = "fedprobe::cli", "interrupt: cancelling outstanding probes");
                    trigger.cancel();
                }
            }
        }
    });
    (token.clone(), token.drop_guard())
}

/// Returns whether the session was still there to receive the stop.
fn request_stop(registry: &ControlRegistry, session: SessionId) -> bool {
    match registry.signal(session, ControlSignal::Stop) {
        Ok(()) => true,
        Err(err) => {
            debug!(target = "fedprobe::cli", session = %session, error = %err, "stop signal not delivered");
            false
        }
    }
}

fn remote(server: &ServerName, failure: ProbeFailure) -> FedProbeError {
    FedProbeError::Federation {
        server: server.to_string(),
        message: failure.to_string(),
    }
}

fn emit<T: Serialize + Display>(value: &T, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(value)?);
    } else {
        print!("{value}");
    }
    Ok(())
}

/// Prints raw key JSON when exactly one server answered. Returns `false` when
/// the tabular report should be shown instead.
fn print_raw(
    targets: &[ServerName],
    report: &DispatchReport<ServerName, ProbePayload>,
) -> Result<bool> {
    let [target] = targets else {
        eprintln!("--raw needs a single server; showing the table instead");
        return Ok(false);
    };
    let Some(result) = report.results.get(target) else {
        return Ok(false);
    };
    match &result.outcome {
        ProbeOutcome::Success(ProbePayload::ServerKeys(keys)) => {
            println!("{}", serde_json::to_string_pretty(&keys.raw)?);
        }
        ProbeOutcome::Success(ProbePayload::NotaryKeys(sets)) => {
            let raw: Vec<_> = sets.iter().map(|keys| &keys.raw).collect();
            println!("{}", serde_json::to_string_pretty(&raw)?);
        }
        _ => return Ok(false),
    }
    Ok(true)
}

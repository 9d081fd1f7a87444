//! Node facade
//!
//! Wires every component together by explicit injection and exposes the
//! four user-facing operations. Nothing in the crate reaches for globals;
//! everything a command needs travels in its [`Context`].

use std::{sync::Arc, time::Duration};

use log::{debug, info};
use tokio::{sync::Mutex, task::JoinHandle};

use crate::{
    command::{CommandData, CommandRegistry, Sequence},
    config::NodeConfig,
    context::Context,
    error::{NodeError, Result},
    executor::CommandExecutor,
    find_shard::FindShardCommand,
    local::{LocalGetCommand, LocalStoreCommand, ValidateAssertionCommand},
    maintenance::{CommandsCleanerCommand, OperationIdCleanerCommand},
    network::UdpTransport,
    network_protocol::{command_names, NetworkProtocolCommand, ScheduleMessagesCommand},
    operation::{OperationId, OperationIdService, OperationPhase, OperationRecord, OperationStatus},
    protocol::{ProtocolInitCommand, ProtocolRequestCommand},
    repository::{CommandRepository, FileRepository, MemoryRepository},
    routing::{AddressBook, AddressEntry, RoutingTable},
    server::RequestHandler,
    sharding::{LocalShardingTable, ShardingTableService},
    store::{MemoryTripleStore, TripleStore},
    transport::{MemoryNetwork, MemoryTransport, NetworkTransport},
    types::{dataset_root, Assertion, BlockchainId, OperationKind, PeerId},
};

/// How the node reaches its peers.
pub enum TransportKind {
    /// UDP on `bind_addr`.
    Udp,
    /// In-process broker shared with other nodes.
    Memory(Arc<MemoryNetwork>),
}

/// Publish or update request.
#[derive(Debug, Clone)]
pub struct AssertionRequest {
    pub blockchain: BlockchainId,
    pub assertion: Assertion,
    pub min_ack_responses: Option<usize>,
}

pub struct Node {
    ctx: Context,
    executor: Arc<CommandExecutor>,
    routing: Arc<RoutingTable>,
    handler: Arc<RequestHandler>,
    udp: Option<Arc<UdpTransport>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Node {
    pub async fn new(config: NodeConfig, transport: TransportKind) -> Result<Self> {
        Self::with_store(config, transport, Arc::new(MemoryTripleStore::new())).await
    }

    pub async fn with_store(
        config: NodeConfig,
        transport: TransportKind,
        store: Arc<dyn TripleStore>,
    ) -> Result<Self> {
        config
            .validate()
            .map_err(|e| NodeError::config(format!("{e:#}")))?;
        let config = Arc::new(config);

        let address_book = Arc::new(AddressBook::new());
        let routing = Arc::new(RoutingTable::new(Arc::clone(&address_book)));
        bootstrap(&config, &routing).await;

        let sharding: Arc<dyn ShardingTableService> =
            Arc::new(LocalShardingTable::new(Arc::clone(&routing), &config));
        let handler = Arc::new(RequestHandler::new(
            &config,
            Arc::clone(&store),
            Arc::clone(&sharding),
        ));
        let (transport, udp) = match transport {
            TransportKind::Udp => {
                let udp = UdpTransport::bind(
                    config.peer_id.clone(),
                    config.bind_addr,
                    Arc::clone(&address_book),
                    handler.clone(),
                )?;
                let transport: Arc<dyn NetworkTransport> = udp.clone();
                (transport, Some(udp))
            }
            TransportKind::Memory(network) => {
                network
                    .register(config.peer_id.clone(), handler.clone())
                    .await;
                let transport: Arc<dyn NetworkTransport> =
                    Arc::new(MemoryTransport::new(config.peer_id.clone(), network));
                (transport, None)
            }
        };

        let repository: Arc<dyn CommandRepository> = match &config.data_dir {
            Some(dir) => Arc::new(FileRepository::open(dir).await?),
            None => Arc::new(MemoryRepository::new()),
        };

        let ctx = Context {
            sharding,
            operations: Arc::new(match &config.data_dir {
                Some(dir) => OperationIdService::open(dir).await?,
                None => OperationIdService::new(),
            }),
            config: Arc::clone(&config),
            transport,
            store,
        };
        let registry = build_registry(&ctx, &repository)?;
        let executor = Arc::new(CommandExecutor::new(
            Arc::new(registry),
            repository,
            &config.executor,
        ));

        Ok(Self {
            ctx,
            executor,
            routing,
            handler,
            udp,
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Replays pending work, restarts the permanent commands and spawns the loops.
    pub async fn start(&self) -> Result<()> {
        self.executor.replay().await?;
        self.executor.init().await?;

        let mut tasks = self.tasks.lock().await;
        let executor = Arc::clone(&self.executor);
        tasks.push(tokio::spawn(async move {
            if let Err(e) = executor.run().await {
                log::error!("Command executor stopped: {e}");
            }
        }));
        if let Some(udp) = &self.udp {
            let udp = Arc::clone(udp);
            tasks.push(tokio::spawn(async move {
                if let Err(e) = udp.run().await {
                    log::error!("UDP receive loop stopped: {e}");
                }
            }));
        }
        info!(
            "Node {} started with {} known peers",
            self.peer_id(),
            self.routing.len().await
        );
        Ok(())
    }

    pub async fn shutdown(&self) {
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
        info!("Node {} stopped", self.peer_id());
    }

    #[must_use]
    pub fn peer_id(&self) -> &PeerId {
        self.ctx.peer_id()
    }

    #[must_use]
    pub fn context(&self) -> &Context {
        &self.ctx
    }

    #[must_use]
    pub fn operations(&self) -> &Arc<OperationIdService> {
        &self.ctx.operations
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn TripleStore> {
        &self.ctx.store
    }

    #[must_use]
    pub fn routing(&self) -> &Arc<RoutingTable> {
        &self.routing
    }

    #[must_use]
    pub fn executor(&self) -> &Arc<CommandExecutor> {
        &self.executor
    }

    #[must_use]
    pub fn request_handler(&self) -> &Arc<RequestHandler> {
        &self.handler
    }

    /// Bound UDP address, when running on UDP.
    pub fn local_addr(&self) -> Option<std::net::SocketAddr> {
        self.udp.as_ref().and_then(|udp| udp.local_addr().ok())
    }

    pub async fn publish(&self, request: AssertionRequest) -> Result<OperationId> {
        self.replicate(OperationKind::Publish, request).await
    }

    pub async fn update(&self, request: AssertionRequest) -> Result<OperationId> {
        self.replicate(OperationKind::Update, request).await
    }

    pub async fn get(
        &self,
        blockchain: BlockchainId,
        key: impl Into<String>,
    ) -> Result<OperationId> {
        let data = CommandData {
            blockchain: Some(blockchain),
            key: Some(key.into()),
            ..CommandData::default()
        };
        self.submit(OperationKind::Get, data, None).await
    }

    pub async fn search(
        &self,
        blockchain: BlockchainId,
        keyword: impl Into<String>,
        limit: Option<usize>,
    ) -> Result<OperationId> {
        let data = CommandData {
            blockchain: Some(blockchain),
            key: Some(keyword.into()),
            limit,
            ..CommandData::default()
        };
        self.submit(OperationKind::Search, data, None).await
    }

    pub async fn wait_for(&self, id: OperationId, timeout: Duration) -> Result<OperationRecord> {
        self.ctx.operations.wait_for(id, timeout).await
    }

    async fn replicate(
        &self,
        kind: OperationKind,
        request: AssertionRequest,
    ) -> Result<OperationId> {
        let data = CommandData {
            blockchain: Some(request.blockchain),
            key: Some(dataset_root(&request.assertion)),
            min_ack_responses: request.min_ack_responses,
            ..CommandData::default()
        };
        self.submit(kind, data, Some(request.assertion)).await
    }

    async fn submit(
        &self,
        kind: OperationKind,
        mut data: CommandData,
        assertion: Option<Assertion>,
    ) -> Result<OperationId> {
        let operations = &self.ctx.operations;
        let id = operations.generate_operation_id(kind).await;
        if let Some(assertion) = assertion {
            operations.cache_data(id, assertion).await?;
        }
        operations
            .update_status(id, OperationStatus::Phase(kind, OperationPhase::Start))
            .await;

        data.operation_id = Some(id);
        data.kind = Some(kind);
        let names = command_names(kind);
        let (first, rest) = names
            .entry
            .split_first()
            .ok_or_else(|| NodeError::internal(format!("{kind} has no entry command")))?;
        let command = self.executor.registry().instantiate(
            first,
            data,
            Sequence::new(rest.iter().copied()),
        )?;
        self.executor.add(command).await?;
        debug!("Submitted {kind} operation {id}");
        Ok(id)
    }
}

/// Seeds the routing table and address book with ourselves and the configured peers.
async fn bootstrap(config: &NodeConfig, routing: &RoutingTable) {
    let protocols: Vec<String> = OperationKind::ALL
        .iter()
        .map(|kind| kind.network_protocol().to_owned())
        .collect();

    for blockchain in &config.blockchains {
        routing.add(&config.peer_id, blockchain).await;
    }
    routing
        .address_book()
        .insert(
            config.peer_id.clone(),
            AddressEntry {
                address: config.bind_addr,
                protocols: protocols.clone(),
            },
        )
        .await;

    for peer in &config.peers {
        for blockchain in &peer.blockchains {
            routing.add(&peer.peer_id, blockchain).await;
        }
        routing
            .address_book()
            .insert(
                peer.peer_id.clone(),
                AddressEntry {
                    address: peer.address,
                    protocols: protocols.clone(),
                },
            )
            .await;
    }
}

/// Registers every handler and checks that each operation's names resolve.
fn build_registry(
    ctx: &Context,
    repository: &Arc<dyn CommandRepository>,
) -> Result<CommandRegistry> {
    let mut registry = CommandRegistry::new();
    registry.register(Arc::new(ValidateAssertionCommand::new(ctx.clone())));
    registry.register(Arc::new(FindShardCommand::new(ctx.clone())));
    registry.register(Arc::new(LocalStoreCommand::new(OperationKind::Publish, ctx.clone())));
    registry.register(Arc::new(LocalStoreCommand::new(OperationKind::Update, ctx.clone())));
    registry.register(Arc::new(LocalGetCommand::new(ctx.clone())));
    for kind in OperationKind::ALL {
        registry.register(Arc::new(NetworkProtocolCommand::new(kind, ctx.clone())));
        registry.register(Arc::new(ScheduleMessagesCommand::new(kind, ctx.clone())));
        registry.register(Arc::new(ProtocolInitCommand::new(kind, ctx.clone())));
        registry.register(Arc::new(ProtocolRequestCommand::new(kind, ctx.clone())));
    }

    let executor = &ctx.config.executor;
    registry.register(Arc::new(CommandsCleanerCommand::new(
        Arc::clone(repository),
        executor.command_cleanup_ms,
    )));
    registry.register(Arc::new(OperationIdCleanerCommand::new(
        Arc::clone(&ctx.operations),
        executor.operation_cleanup_ms,
    )));

    for kind in OperationKind::ALL {
        registry.validate(command_names(kind).all())?;
    }
    Ok(registry)
}

use super::{ProcedureTable, RpcClient, RpcError, RpcServer};
use crate::routing::{Port, Router};
use std::sync::Arc;

/// A server and a client registered together under one service name
///
/// The server listener is active from construction on; the client listener
/// only during calls.
pub struct RpcEndpoint {
    pub server: RpcServer,
    pub client: RpcClient,
}

impl RpcEndpoint {
    pub fn new(
        router: Arc<Router>,
        name: &str,
        server_port: Port,
        client_port: Port,
        procs: ProcedureTable,
    ) -> Result<Self, RpcError> {
        let server = RpcServer::new(Arc::clone(&router), name, server_port, procs)?;
        let client = RpcClient::new(router, name, client_port)?;
        server.activate();
        Ok(Self { server, client })
    }
}

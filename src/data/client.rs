//! Consumer-side data service access: turns the two streaming RPCs back into
//! scanners. Analyzers and the config resolver use this instead of touching
//! repositories directly.

use async_trait::async_trait;

use super::{Change, ChangeGetter, ChangeScanner, ChangesRequest, File, FileGetter, FileScanner, FilesRequest};
use crate::rpc::client::RpcClient;
use crate::rpc::RpcError;

#[derive(Clone)]
pub struct DataClient {
    rpc: RpcClient,
}

impl DataClient {
    pub async fn connect(addr: &str) -> Result<Self, RpcError> {
        Ok(Self {
            rpc: RpcClient::connect(addr).await?,
        })
    }

    pub fn new(rpc: RpcClient) -> Self {
        Self { rpc }
    }
}

#[async_trait]
impl ChangeGetter for DataClient {
    async fn get_changes(&self, req: &ChangesRequest) -> Result<ChangeScanner, RpcError> {
        let scanner = self
            .rpc
            .call_streaming::<_, Change>("data.getChanges", req)
            .await?;
        Ok(Box::new(scanner))
    }
}

#[async_trait]
impl FileGetter for DataClient {
    async fn get_files(&self, req: &FilesRequest) -> Result<FileScanner, RpcError> {
        let scanner = self
            .rpc
            .call_streaming::<_, File>("data.getFiles", req)
            .await?;
        Ok(Box::new(scanner))
    }
}

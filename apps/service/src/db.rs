use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::Mutex;
use tokio_postgres::{Client, NoTls};

use crate::migrations;

/// Shared handle to the durable store's connection.
#[derive(Clone)]
pub struct Db {
    client: Arc<Mutex<Client>>,
}

impl Db {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let (client, connection) = tokio_postgres::connect(database_url, NoTls)
            .await
            .context("connect to postgres")?;

        tokio::spawn(async move {
            if let Err(error) = connection.await {
                tracing::error!(reason = %error, "postgres connection error");
            }
        });

        Ok(Self {
            client: Arc::new(Mutex::new(client)),
        })
    }

    pub fn client(&self) -> Arc<Mutex<Client>> {
        self.client.clone()
    }

    /// Apply pending migrations through the `schema_migrations` ledger.
    pub async fn migrate(&self) -> Result<usize> {
        let client = self.client();
        let mut client = client.lock().await;
        migrations::apply(&mut client).await
    }

    /// Liveness probe used by the health endpoint.
    pub async fn ping(&self) -> Result<()> {
        let client = self.client();
        let client = client.lock().await;
        client
            .simple_query("SELECT 1")
            .await
            .context("database probe")?;
        Ok(())
    }
}

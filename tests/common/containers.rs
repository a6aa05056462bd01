// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Testcontainers setup for MongoDB.
//!
//! Provides a single-member replica set so the oplog exists.

use bson::doc;
use mongodb::{options::ClientOptions, Client};
use std::time::Duration;
use testcontainers::{clients::Cli, core::WaitFor, Container, GenericImage, RunnableImage};

pub const REPLICA_SET: &str = "rs0";

/// Create a `mongod --replSet rs0` container.
///
/// Uses official mongo:6 image. Waits for "Waiting for connections".
pub fn mongo_container(docker: &Cli) -> Container<'_, GenericImage> {
    let image = GenericImage::new("mongo", "6.0")
        .with_exposed_port(27017)
        .with_wait_for(WaitFor::message_on_stdout("Waiting for connections"));
    let args = vec!["--replSet".to_string(), REPLICA_SET.to_string()];
    docker.run(RunnableImage::from((image, args)))
}

/// Connection string for a container. Direct connection, since the member
/// advertises its in-container address.
pub fn mongo_url(container: &Container<'_, GenericImage>) -> String {
    let port = container.get_host_port_ipv4(27017);
    format!("mongodb://127.0.0.1:{}/?directConnection=true", port)
}

/// Initiate the replica set and wait for the member to become primary.
pub async fn init_replica_set(url: &str) -> Client {
    let options = ClientOptions::parse(url).await.unwrap();
    let client = Client::with_options(options).unwrap();
    let admin = client.database("admin");

    admin
        .run_command(
            doc! {
                "replSetInitiate": {
                    "_id": REPLICA_SET,
                    "members": [{ "_id": 0, "host": "localhost:27017" }],
                }
            },
            None,
        )
        .await
        .unwrap();

    for _ in 0..60 {
        let reply = admin.run_command(doc! { "isMaster": 1 }, None).await.unwrap();
        if reply.get_bool("ismaster").unwrap_or(false) {
            return client;
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
    panic!("replica set member never became primary");
}

/// Helper struct for a running replica set.
pub struct TestReplicaSet<'a> {
    #[allow(dead_code)] // Kept alive for container lifetime
    container: Container<'a, GenericImage>,
    pub url: String,
    pub client: Client,
}

impl<'a> TestReplicaSet<'a> {
    pub async fn start(docker: &'a Cli) -> TestReplicaSet<'a> {
        let container = mongo_container(docker);
        let url = mongo_url(&container);
        let client = init_replica_set(&url).await;
        Self {
            container,
            url,
            client,
        }
    }
}

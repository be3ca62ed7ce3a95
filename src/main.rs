use qoredb_broker::observability;

#[tokio::main]
async fn main() {
    observability::init_tracing();

    if let Err(e) = qoredb_broker::run().await {
        tracing::error!(error = %e, "Broker terminated");
        eprintln!("qoredb-broker: {}", e);
        std::process::exit(1);
    }
}

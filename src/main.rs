use virtumancer::telemetry::{get_subscriber, init_subscriber};
use virtumancer::{configuration::get_configuration, database, startup::run};

#[tokio::main]
async fn main() -> std::io::Result<()> {
    let subscriber = get_subscriber("virtumancer".into(), "info".into(), std::io::stdout);
    init_subscriber(subscriber);

    let configuration = get_configuration().expect("Failed to read configuration.");

    let db_pool = database::connect(&configuration.database.path)
        .await
        .expect("Failed to open database");
    database::run_migrations(&db_pool)
        .await
        .expect("Failed to run migrations");

    if let Err(e) = run(configuration, db_pool).await {
        tracing::error!("Server failed: {}", e);
    }

    Ok(())
}

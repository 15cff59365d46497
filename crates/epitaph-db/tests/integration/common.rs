use chrono::NaiveDate;
use epitaph_core::models::Subject;
use epitaph_db::Database;
use sqlx::postgres::PgPoolOptions;
use testcontainers::core::{ContainerPort, WaitFor};
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, GenericImage, ImageExt};

/// Spins up a PostgreSQL container, applies the migrations and returns the
/// database facade.
///
/// The `ContainerAsync` must be kept in scope for the test duration;
/// dropping it stops the container.
pub async fn setup_test_db() -> (Database, ContainerAsync<GenericImage>) {
    let container = GenericImage::new("postgres", "16")
        .with_exposed_port(ContainerPort::Tcp(5432))
        .with_wait_for(WaitFor::message_on_stderr(
            "database system is ready to accept connections",
        ))
        .with_env_var("POSTGRES_PASSWORD", "postgres")
        .with_env_var("POSTGRES_DB", "epitaph_test")
        .start()
        .await
        .expect("Failed to start PostgreSQL container");

    let host = container.get_host().await.expect("Failed to get host");
    let port = container
        .get_host_port_ipv4(5432)
        .await
        .expect("Failed to get port");

    let connection_string = format!("postgresql://postgres:postgres@{host}:{port}/epitaph_test");

    // The server restarts once after initdb; retry until it accepts us.
    const MAX_RETRIES: u32 = 30;
    let mut retries = 0;
    let pool = loop {
        match PgPoolOptions::new()
            .max_connections(5)
            .connect(&connection_string)
            .await
        {
            Ok(pool) => break pool,
            Err(e) => {
                retries += 1;
                if retries >= MAX_RETRIES {
                    panic!("Failed to connect to database after {MAX_RETRIES} retries: {e}");
                }
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            }
        }
    };

    let db = Database::from_pool(pool);
    db.migrate().await.expect("Failed to run migrations");
    (db, container)
}

pub fn subject(id: i64, name: &str) -> Subject {
    Subject::new(id, name).with_deathday(NaiveDate::from_ymd_opt(2020, 1, 1).unwrap())
}

/// Database seeded with subjects 1..=n named "Subject {id}".
pub async fn seeded_db(n: i64) -> (Database, ContainerAsync<GenericImage>) {
    let (db, container) = setup_test_db().await;
    let subjects: Vec<Subject> = (1..=n).map(|id| subject(id, &format!("Subject {id}"))).collect();
    db.subject_repo().upsert_subjects(&subjects).await.unwrap();
    (db, container)
}

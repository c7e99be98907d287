//! Invitation lifecycle scenarios against PostgreSQL.
//!
//! These tests use a shared PostgreSQL container. Run with:
//!
//! ```bash
//! cargo test -p user-lifecycle --test postgres_scenarios -- --test-threads=1
//! ```

use std::sync::Arc;

use projections::SessionFactory;
use sqlx::PgPool;
use store::{DocumentStoreExt, EventStoreExt, PostgresStore, StoreError};
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;
use user_lifecycle::{
    ActiveUser, AppError, InvitationAccepted, InvitedUser, UserInvited, UserService, registry,
};

struct ContainerInfo {
    #[allow(dead_code)] // Container must stay alive for tests
    container: ContainerAsync<Postgres>,
    connection_string: String,
}

static CONTAINER: OnceCell<Arc<ContainerInfo>> = OnceCell::const_new();

async fn get_container_info() -> Arc<ContainerInfo> {
    CONTAINER
        .get_or_init(|| async {
            let container = Postgres::default().start().await.unwrap();
            let host = container.get_host().await.unwrap();
            let port = container.get_host_port_ipv4(5432).await.unwrap();
            let connection_string =
                format!("postgres://postgres:postgres@{}:{}/postgres", host, port);

            let pool = PgPool::connect(&connection_string).await.unwrap();
            PostgresStore::new(pool.clone()).run_migrations().await.unwrap();
            pool.close().await;

            Arc::new(ContainerInfo {
                container,
                connection_string,
            })
        })
        .await
        .clone()
}

/// A session factory over a fresh pool. Tests use fresh stream ids, so tables
/// are not cleared between them.
async fn get_factory() -> SessionFactory<PostgresStore> {
    let info = get_container_info().await;
    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(5)
        .connect(&info.connection_string)
        .await
        .unwrap();

    SessionFactory::new(PostgresStore::new(pool), registry().unwrap())
}

#[tokio::test]
async fn invite_and_accept_in_separate_sessions() {
    let factory = get_factory().await;
    let invited = UserInvited::new("jane@acme.inc", "Jane");
    let id = invited.id;

    let mut session = factory.open_session();
    session.append(id, &invited).unwrap();
    session.commit().await.unwrap();

    let mut session = factory.open_session();
    session.append(id, &InvitationAccepted::of(&invited)).unwrap();
    session.commit().await.unwrap();

    assert!(factory.store().load::<InvitedUser>(id).await.unwrap().is_none());
    let active = factory.store().load::<ActiveUser>(id).await.unwrap().unwrap();
    assert_eq!(active.name, "Jane");
}

#[tokio::test]
async fn invite_and_accept_in_one_session() {
    let factory = get_factory().await;
    let invited = UserInvited::new("jane@acme.inc", "Jane");
    let id = invited.id;

    let mut session = factory.open_session();
    session.append(id, &invited).unwrap();
    session.append(id, &InvitationAccepted::of(&invited)).unwrap();
    session.commit().await.unwrap();

    assert!(factory.store().load::<InvitedUser>(id).await.unwrap().is_none());
    let active = factory.store().load::<ActiveUser>(id).await.unwrap().unwrap();
    assert_eq!(active.name, "Jane");
    assert_eq!(factory.store().read_full_stream(id).await.unwrap().len(), 2);
}

#[tokio::test]
async fn invite_only() {
    let factory = get_factory().await;
    let invited = UserInvited::new("jane@acme.inc", "Jane");
    let id = invited.id;

    let mut session = factory.open_session();
    session.start_stream(id, &invited).unwrap();
    session.commit().await.unwrap();

    assert!(factory.store().load::<InvitedUser>(id).await.unwrap().is_some());
    assert!(factory.store().load::<ActiveUser>(id).await.unwrap().is_none());
}

#[tokio::test]
async fn accept_without_invitation() {
    let factory = get_factory().await;
    let invited = UserInvited::new("jane@acme.inc", "Jane");
    let id = invited.id;

    let mut session = factory.open_session();
    session.append(id, &InvitationAccepted::of(&invited)).unwrap();
    session.commit().await.unwrap();

    assert!(factory.store().load::<ActiveUser>(id).await.unwrap().is_some());
}

#[tokio::test]
async fn concurrent_start_commits_once() {
    let factory = get_factory().await;
    let invited = UserInvited::new("jane@acme.inc", "Jane");
    let id = invited.id;

    let mut first = factory.open_session();
    first.start_stream(id, &invited).unwrap();
    let mut second = factory.open_session();
    second.start_stream(id, &invited).unwrap();

    let (a, b) = tokio::join!(first.commit(), second.commit());
    let failures: Vec<_> = [a, b].into_iter().filter_map(Result::err).collect();

    assert_eq!(failures.len(), 1);
    assert!(matches!(
        failures[0],
        projections::ProjectionError::Store(StoreError::ConcurrencyConflict { .. })
    ));
    assert_eq!(factory.store().read_full_stream(id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn service_lifecycle() {
    let service = UserService::new(get_factory().await);

    let id = service.invite("jane@acme.inc", "Jane").await.unwrap();
    service.accept(id).await.unwrap();
    service.rename(id, "Janet").await.unwrap();

    let user = service.user(id).await.unwrap().unwrap();
    assert!(user.is_active());
    assert_eq!(user.name(), "Janet");

    assert!(matches!(
        service.accept(id).await,
        Err(AppError::UserNotFound(_))
    ));
}

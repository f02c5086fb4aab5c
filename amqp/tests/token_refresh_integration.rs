mod common;

use amqp::auth::{AuthorizationOutcome, TokenRefreshManager};
use amqp::common::AmqpError;
use amqp::connection_manager::AmqpConnection;
use amqp::transport::ResponseCode;
use claims::{assert_err, assert_matches, assert_none, assert_ok};
use common::*;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

// Helper module for refresh scenarios driven through a full connection
mod refresh_helpers {
    use super::*;

    pub async fn authorized_manager(
        transport: &Arc<FakeTransport>,
    ) -> (AmqpConnection, TokenRefreshManager) {
        let connection = connect(transport);
        let audience = connection.audience_for("telemetry");
        let manager = connection
            .token_manager(&audience, &audience)
            .await
            .expect("token manager");
        (connection, manager)
    }

    pub fn assert_near_540s(delay: Duration) {
        assert!(
            delay >= Duration::from_secs(539) && delay <= Duration::from_secs(540),
            "unexpected refresh delay {delay:?}"
        );
    }

    /// True when no outcome arrives within one (virtual) millisecond
    pub async fn no_outcome_pending(
        outcomes: &mut futures::stream::BoxStream<'static, AuthorizationOutcome>,
    ) -> bool {
        tokio::time::timeout(Duration::from_millis(1), outcomes.next())
            .await
            .is_err()
    }
}

use refresh_helpers::*;

mod scheduled_refresh {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn refresh_fires_after_ninety_percent_of_validity() {
        let transport = FakeTransport::new().build();
        let broker = transport.broker();
        let (_connection, manager) = authorized_manager(&transport).await;
        let mut outcomes = manager.outcomes();

        let delay = assert_ok!(manager.authorize().await);
        assert_near_540s(delay);
        assert_near_540s(manager.last_refresh_interval());

        sleep(Duration::from_secs(500)).await;
        assert_eq!(broker.put_tokens().len(), 1);
        assert!(no_outcome_pending(&mut outcomes).await);

        sleep(Duration::from_secs(41)).await;
        assert_eq!(broker.put_tokens().len(), 2);
        assert_matches!(outcomes.next().await, Some(AuthorizationOutcome::Accepted));
        assert!(manager.is_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn transient_refresh_failure_is_silent_and_retried() {
        let transport = FakeTransport::new().build();
        let broker = transport.broker();
        broker.script_cbs([ResponseCode::Accepted, ResponseCode::ServiceUnavailable]);
        let (_connection, manager) = authorized_manager(&transport).await;
        let mut outcomes = manager.outcomes();

        let delay = assert_ok!(manager.authorize().await);

        sleep(Duration::from_secs(541)).await;
        assert_eq!(broker.put_tokens().len(), 2);
        assert!(no_outcome_pending(&mut outcomes).await);
        assert_eq!(manager.last_refresh_interval(), delay);
        assert!(manager.is_armed());

        sleep(Duration::from_secs(540)).await;
        assert_eq!(broker.put_tokens().len(), 3);
        assert_matches!(outcomes.next().await, Some(AuthorizationOutcome::Accepted));
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_refresh_is_published_once_and_stops_schedule() {
        let transport = FakeTransport::new().build();
        let broker = transport.broker();
        broker.script_cbs([ResponseCode::Accepted, ResponseCode::Unauthorized]);
        let (_connection, manager) = authorized_manager(&transport).await;
        let mut outcomes = manager.outcomes();

        assert_ok!(manager.authorize().await);

        sleep(Duration::from_secs(541)).await;
        match outcomes.next().await {
            Some(AuthorizationOutcome::Failed(error)) => {
                assert!(error.is_authentication_error());
                assert_eq!(error.response_code(), Some(ResponseCode::Unauthorized));
            }
            other => panic!("expected a failed outcome, got {other:?}"),
        }
        assert!(!manager.is_armed());

        sleep(Duration::from_secs(3_000)).await;
        assert_eq!(broker.put_tokens().len(), 2);
        assert!(no_outcome_pending(&mut outcomes).await);

        // An explicit authorize re-arms the schedule
        assert_ok!(manager.authorize().await);
        assert!(manager.is_armed());
        sleep(Duration::from_secs(541)).await;
        assert_eq!(broker.put_tokens().len(), 4);
        assert_matches!(outcomes.next().await, Some(AuthorizationOutcome::Accepted));
    }
}

mod disposal {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn closed_manager_rejects_authorize_without_round_trip() {
        let transport = FakeTransport::new().build();
        let broker = transport.broker();
        let (connection, manager) = authorized_manager(&transport).await;
        let mut outcomes = manager.outcomes();

        assert_ok!(manager.authorize().await);
        manager.close();
        manager.close();

        let error = assert_err!(manager.authorize().await);
        assert_matches!(error, AmqpError::Disposed { .. });
        assert_none!(outcomes.next().await);

        sleep(Duration::from_secs(2_000)).await;
        assert_eq!(broker.put_tokens().len(), 1);
        assert_matches!(connection.state(), amqp::connection_manager::ConnectionState::Active);
    }

    #[tokio::test(start_paused = true)]
    async fn independent_audiences_refresh_independently() {
        let transport = FakeTransport::new().build();
        let broker = transport.broker();
        let connection = connect(&transport);
        let orders = connection.audience_for("orders");
        let billing = connection.audience_for("billing");

        let first = assert_ok!(connection.token_manager(&orders, &orders).await);
        let second = assert_ok!(connection.token_manager(&billing, &billing).await);
        assert_ok!(first.authorize().await);
        assert_ok!(second.authorize().await);

        second.close();
        sleep(Duration::from_secs(541)).await;

        let refreshed: Vec<_> = broker
            .put_tokens()
            .into_iter()
            .filter_map(|request| request.property("name").map(str::to_string))
            .collect();
        assert_eq!(refreshed, vec![orders.clone(), billing, orders]);
        assert!(first.is_armed());
    }
}

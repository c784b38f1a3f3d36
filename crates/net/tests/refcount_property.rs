//! Property checks over the attach/detach algebra of a channel reference.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use proptest::prelude::*;

use r66_core::{ConnectionError, HostId, R66Config};
use r66_net::testing::{MemoryConnection, MemoryConnector, TestSession};
use r66_net::{Authenticator, Connection, Connector, NetworkTransaction};

#[derive(Clone, Debug)]
enum Op {
    Attach,
    DetachOldest,
    DetachUnknown,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => Just(Op::Attach),
        2 => Just(Op::DetachOldest),
        1 => Just(Op::DetachUnknown),
    ]
}

struct AddressAuthenticator;

impl Authenticator for AddressAuthenticator {
    fn handshake(&self, connection: &dyn Connection) -> Result<HostId, ConnectionError> {
        Ok(HostId::new(connection.remote_addr().to_string()))
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// The refcount always equals the number of attached sessions plus the
    /// unconsumed creation claim, and never goes negative. Detaching a
    /// session the channel never saw changes nothing.
    #[test]
    fn refcount_matches_the_attach_detach_algebra(ops in proptest::collection::vec(op_strategy(), 1..24)) {
        let config = R66Config::new()
            .with_connection_timeout(Duration::from_secs(5))
            .with_retry_limit(3);
        let transaction = NetworkTransaction::new(
            config,
            Arc::new(MemoryConnector::new()) as Arc<dyn Connector>,
            Arc::new(AddressAuthenticator),
            false,
        );
        let addr = SocketAddr::from(([127, 0, 0, 1], 6666));
        let channel = transaction
            .accept_connection(Box::new(MemoryConnection::new(addr)))
            .expect("inbound connection registers");

        let mut attached: Vec<u64> = Vec::new();
        let mut next_session = 1_u64;
        let mut creation_claim = 1_i64;

        for op in ops {
            match op {
                Op::Attach => {
                    let id = next_session;
                    next_session += 1;
                    transaction
                        .add_local_channel(&channel, Arc::new(TestSession::new(id)))
                        .expect("channel never shuts down in this model");
                    creation_claim = 0;
                    attached.push(id);
                }
                Op::DetachOldest => {
                    if let Some(id) = attached.first().copied() {
                        attached.remove(0);
                        transaction.remove_local_channel(&channel, id);
                    }
                }
                Op::DetachUnknown => {
                    transaction.remove_local_channel(&channel, u64::MAX);
                }
            }

            let expected = i64::try_from(attached.len()).expect("bounded op count") + creation_claim;
            prop_assert_eq!(channel.refcount(), expected);
            prop_assert!(channel.refcount() >= 0);
            prop_assert_eq!(transaction.number_of_local_channels(&channel), attached.len());
        }

        transaction.shutdown();
    }
}

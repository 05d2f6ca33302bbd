//! Validator-set changes driven through committed transactions.
//!
//! Power diffs returned by the application for block H take effect at
//! height H+2, and every node must evolve its set identically.

use palisade_abci::kvstore::make_validator_tx;
use palisade_simulation::{NetworkConfig, SimulationRunner};
use palisade_types::test_utils::test_keypair;
use palisade_types::ValidatorUpdate;
use std::time::Duration;

#[test]
fn added_validator_appears_in_every_node_set() {
    let mut runner = SimulationRunner::new(NetworkConfig::default(), 21);
    runner.start();
    runner.run_until(Duration::from_millis(500));

    // A new (non-participating) validator with little power: the four
    // live nodes keep quorum.
    let newcomer = test_keypair(100);
    let update = ValidatorUpdate {
        pub_key: newcomer.public_key(),
        power: 5,
    };
    runner.submit_tx(0, make_validator_tx(&update));
    runner.run_until(runner.now() + Duration::from_secs(8));

    for node in 0..runner.node_count() {
        let chain = runner.chain(node).unwrap();
        let (_, val) = chain
            .validators
            .get_by_address(&newcomer.address())
            .unwrap_or_else(|| panic!("node {node} never adopted the new validator"));
        assert_eq!(val.voting_power, 5);
        assert_eq!(chain.validators.len(), 5);
    }

    // All nodes hash the evolved set identically.
    let reference = runner.chain(0).unwrap().validators.hash();
    for node in 1..runner.node_count() {
        assert_eq!(runner.chain(node).unwrap().validators.hash(), reference);
    }
}

#[test]
fn removed_validator_leaves_every_node_set() {
    let mut runner = SimulationRunner::new(NetworkConfig::default(), 22);
    runner.start();

    let extra = test_keypair(101);
    runner.submit_tx(
        0,
        make_validator_tx(&ValidatorUpdate {
            pub_key: extra.public_key(),
            power: 5,
        }),
    );
    runner.run_until(Duration::from_secs(6));
    assert!(runner
        .chain(0)
        .unwrap()
        .validators
        .has_address(&extra.address()));

    // Power zero removes.
    runner.submit_tx(
        1,
        make_validator_tx(&ValidatorUpdate {
            pub_key: extra.public_key(),
            power: 0,
        }),
    );
    runner.run_until(runner.now() + Duration::from_secs(8));

    for node in 0..runner.node_count() {
        let chain = runner.chain(node).unwrap();
        assert!(
            !chain.validators.has_address(&extra.address()),
            "node {node} still carries the removed validator"
        );
        assert_eq!(chain.validators.len(), 4);
    }
}

#[test]
fn update_lags_two_heights_behind_its_block() {
    let mut runner = SimulationRunner::new(NetworkConfig::default(), 23);
    runner.start();

    let newcomer = test_keypair(102);
    let tx = make_validator_tx(&ValidatorUpdate {
        pub_key: newcomer.public_key(),
        power: 5,
    });
    runner.submit_tx(0, tx.clone());
    runner.run_until(Duration::from_secs(8));

    // Find the block that carried the update.
    let node = 0;
    let top = runner.committed(node).last().unwrap().0;
    let carrier = (1..=top)
        .find(|h| {
            runner
                .block(node, *h)
                .is_some_and(|(block, _)| block.data.contains(&tx))
        })
        .expect("the update committed");

    // H+1 is still signed by the old set; H+2 includes the newcomer.
    let (at_h1, _) = runner.block(node, carrier + 1).expect("H+1 exists");
    let (at_h2, _) = runner.block(node, carrier + 2).expect("H+2 exists");
    let (carrier_block, _) = runner.block(node, carrier).unwrap();

    assert_eq!(
        at_h1.header.validators_hash, carrier_block.header.next_validators_hash,
        "H+1 must be signed by the set fixed before the update"
    );
    assert_ne!(
        at_h2.header.validators_hash, at_h1.header.validators_hash,
        "H+2 must be signed by the updated set"
    );
    assert_eq!(at_h1.header.next_validators_hash, at_h2.header.validators_hash);
}

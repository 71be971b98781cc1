use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use proptest::prelude::*;
use upc_core::{Connector, ConnectorConfig, DefaultKeyManager, PeerProtocol, Store};

#[derive(Debug, Clone)]
enum Op {
    Register(u8),
    Unregister(u8),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0u8..6).prop_map(Op::Register),
        (0u8..6).prop_map(Op::Unregister),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn live_tokens_unique_and_stable(ops in proptest::collection::vec(op(), 1..40)) {
        let store = Arc::new(Store::in_memory());
        let keys = Arc::new(DefaultKeyManager::plain(Arc::clone(&store)));
        let c = Connector::new(Arc::clone(&store), keys, ConnectorConfig::default());
        c.bind_peer("dist", PeerProtocol::Legacy);

        let mut live: BTreeMap<String, String> = BTreeMap::new();
        let mut ever: HashSet<String> = HashSet::new();
        for op in ops {
            match op {
                Op::Register(i) => {
                    let instance = format!("i{}", i);
                    c.register(&instance, None, None).unwrap();
                    let token = store.registration(&instance).unwrap().token;
                    match live.get(&instance) {
                        // Re-register keeps the token.
                        Some(prev) => prop_assert_eq!(prev, &token),
                        // A fresh registration never reuses any earlier token.
                        None => prop_assert!(ever.insert(token.clone())),
                    }
                    live.insert(instance, token);
                }
                Op::Unregister(i) => {
                    let instance = format!("i{}", i);
                    c.unregister(&instance);
                    let was_live = live.remove(&instance).is_some();
                    prop_assert!(store.registration(&instance).is_none());
                    if was_live && live.is_empty() {
                        prop_assert!(store.peer().is_none());
                    }
                }
            }
            let tokens: HashSet<_> = store.registrations().into_iter().map(|r| r.token).collect();
            prop_assert_eq!(tokens.len(), live.len());
        }
    }
}

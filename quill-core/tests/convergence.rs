use proptest::prelude::*;
use quill_core::{Document, DocumentConfig, TextEdit, Update};
use uuid::Uuid;

const REPLICAS: usize = 3;

#[derive(Debug, Clone)]
enum Action {
    Insert { replica: usize, at: usize, text: String },
    Delete { replica: usize, at: usize, len: usize },
    Deliver { from: usize, to: usize, pick: usize },
}

fn action() -> impl Strategy<Value = Action> {
    prop_oneof![
        3 => (0..REPLICAS, any::<usize>(), "[a-zé\n]{1,4}")
            .prop_map(|(replica, at, text)| Action::Insert { replica, at, text }),
        2 => (0..REPLICAS, any::<usize>(), 1usize..4)
            .prop_map(|(replica, at, len)| Action::Delete { replica, at, len }),
        3 => (0..REPLICAS, 0..REPLICAS, any::<usize>())
            .prop_map(|(from, to, pick)| Action::Deliver { from, to, pick }),
    ]
}

struct Cluster {
    docs: Vec<Document>,
    logs: Vec<Vec<Update>>,
}

impl Cluster {
    fn new(config: DocumentConfig) -> Self {
        let docs = (0..REPLICAS)
            .map(|i| Document::with_config(Uuid::from_u128(i as u128 + 1), config.clone()))
            .collect();
        Self {
            docs,
            logs: vec![Vec::new(); REPLICAS],
        }
    }

    fn run(&mut self, action: &Action) {
        match action {
            Action::Insert { replica, at, text } => {
                let doc = &mut self.docs[*replica];
                let at = at % (doc.len() + 1);
                let update = doc.apply_local_insert(at, text).unwrap();
                self.logs[*replica].push(update);
            }
            Action::Delete { replica, at, len } => {
                let doc = &mut self.docs[*replica];
                if doc.is_empty() {
                    return;
                }
                let at = at % doc.len();
                let len = (*len).min(doc.len() - at);
                let update = doc.apply_local_delete(at, len).unwrap();
                self.logs[*replica].push(update);
            }
            Action::Deliver { from, to, pick } => {
                if from == to || self.logs[*from].is_empty() {
                    return;
                }
                let update = self.logs[*from][pick % self.logs[*from].len()].clone();
                let before = self.docs[*to].text();
                let delta = self.docs[*to].merge_remote(&update);
                assert_eq!(delta.apply_to(&before), self.docs[*to].text());
            }
        }
    }

    /// One round of pairwise state-vector diffs.
    fn handshake(&mut self) {
        for to in 0..REPLICAS {
            for from in 0..REPLICAS {
                if from == to {
                    continue;
                }
                let update = self.docs[from].diff(&self.docs[to].state_vector());
                self.docs[to].merge_remote(&update);
            }
        }
    }

    fn all_updates(&self) -> Vec<Update> {
        self.logs.iter().flatten().cloned().collect()
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    /// Every replica receives every update, in reverse order and twice over.
    #[test]
    fn replicas_converge_after_full_delivery(actions in prop::collection::vec(action(), 1..60)) {
        let mut cluster = Cluster::new(DocumentConfig { max_pending_rounds: 100_000 });
        for action in &actions {
            cluster.run(action);
        }

        let updates = cluster.all_updates();
        for doc in cluster.docs.iter_mut() {
            for update in updates.iter().rev().chain(updates.iter()) {
                let before = doc.text();
                let delta = doc.merge_remote(update);
                prop_assert_eq!(delta.apply_to(&before), doc.text());
            }
            prop_assert_eq!(doc.pending_len(), 0);
        }

        let text = cluster.docs[0].text();
        for doc in &cluster.docs[1..] {
            prop_assert_eq!(&doc.text(), &text);
            prop_assert_eq!(doc.state_vector(), cluster.docs[0].state_vector());
        }
    }

    /// One round of state-vector diffs converges regardless of what was delivered before.
    #[test]
    fn replicas_converge_after_handshake(actions in prop::collection::vec(action(), 1..60)) {
        let mut cluster = Cluster::new(DocumentConfig::default());
        for action in &actions {
            cluster.run(action);
        }

        cluster.handshake();

        let text = cluster.docs[0].text();
        for doc in &cluster.docs[1..] {
            prop_assert_eq!(&doc.text(), &text);
        }
    }
}

#[test]
fn merge_is_commutative_for_concurrent_edits() {
    let base = Document::seeded(Uuid::from_u128(100), "hello world");
    let mut a = Document::import_snapshot(Uuid::from_u128(1), &base.export_snapshot().unwrap()).unwrap();
    let mut b = Document::import_snapshot(Uuid::from_u128(2), &base.export_snapshot().unwrap()).unwrap();
    let mut c = Document::import_snapshot(Uuid::from_u128(3), &base.export_snapshot().unwrap()).unwrap();

    let ua = a.apply_local_edit(&TextEdit::new(0, 5, "HELLO")).unwrap();
    let ub = b.apply_local_insert(11, "!").unwrap();
    let uc = c.apply_local_delete(4, 3).unwrap();

    a.merge_remote(&ub);
    a.merge_remote(&uc);
    b.merge_remote(&uc);
    b.merge_remote(&ua);
    c.merge_remote(&ua);
    c.merge_remote(&ub);

    assert_eq!(a.text(), "HELLOorld!");
    assert_eq!(b.text(), a.text());
    assert_eq!(c.text(), a.text());
}

#[test]
fn replay_of_whole_history_is_a_noop() {
    let mut a = Document::new(Uuid::from_u128(1));
    let mut b = Document::new(Uuid::from_u128(2));
    let mut history = Vec::new();
    history.push(a.apply_local_insert(0, "abcdef").unwrap());
    history.push(a.apply_local_delete(1, 2).unwrap());
    history.push(a.apply_local_insert(1, "XY").unwrap());

    for update in &history {
        b.merge_remote(update);
    }
    let text = b.text();
    for update in &history {
        assert!(b.merge_remote(update).is_empty());
    }
    assert_eq!(b.text(), text);
    assert_eq!(text, "aXYdef");
}

#[test]
fn handshake_extends_run_parked_by_earlier_delivery() {
    let mut cluster = Cluster::new(DocumentConfig::default());
    for action in [
        Action::Insert { replica: 2, at: 0, text: "é".into() },
        Action::Deliver { from: 2, to: 0, pick: 0 },
        Action::Delete { replica: 0, at: 0, len: 1 },
        Action::Insert { replica: 0, at: 0, text: "a\na".into() },
        Action::Insert { replica: 0, at: 3, text: "é".into() },
        // Replica 1 gets "a\na" without the delete before it, and parks it.
        Action::Deliver { from: 0, to: 1, pick: 1 },
    ] {
        cluster.run(&action);
    }
    assert_eq!(cluster.docs[1].pending_len(), 1);

    // Replica 0 now sends "a\naé" as one run starting at the parked id.
    cluster.handshake();

    for doc in &cluster.docs {
        assert_eq!(doc.text(), "a\naé");
        assert_eq!(doc.pending_len(), 0);
        assert_eq!(doc.state_vector(), cluster.docs[0].state_vector());
    }
}

//! Node lifecycle notifications.
//!
//! Whatever owns node registration calls these after its store write
//! succeeds. Any node change may make room for a blocked runner, so each
//! one moves every blocked runner back into line.

use hangar_core::Node;
use tracing::debug;

use crate::scheduler::Scheduler;

impl Scheduler {
    pub fn notify_node_created(&self, node: Node) {
        debug!(node_id = %node.id, name = %node.name, "Node created");
        self.cache.add_node(node);
        self.queue.unblock_all();
    }

    pub fn notify_node_updated(&self, node: Node) {
        let node_id = node.id;
        if !self.cache.put_node(node) {
            debug!(node_id = %node_id, "Update for unknown node ignored");
        }
        self.queue.unblock_all();
    }

    /// Stop considering a node. Runners already bound to it are untouched.
    pub fn notify_node_deleted(&self, node: Node) {
        if self.cache.del_node(node.id).is_some() {
            debug!(node_id = %node.id, "Node deleted");
        }
        self.queue.unblock_all();
    }
}

#[cfg(test)]
mod tests {
    use hangar_config::SchedulerConfig;
    use hangar_core::node::BYTES_PER_MB;
    use hangar_core::{Node, Resource, Runner};
    use hangar_db::MemoryStore;
    use std::sync::Arc;

    use crate::scheduler::Scheduler;

    fn node(name: &str) -> Node {
        Node::new(
            name,
            "acme",
            "default",
            Resource::new(2),
            Resource::new(1024 * BYTES_PER_MB),
        )
    }

    fn blocked_runner(scheduler: &Scheduler) -> Runner {
        let runner = Runner::new("job", "acme", "default", 1, 128);
        scheduler.schedule(runner.clone()).unwrap();
        let item = scheduler.queue().try_dequeue().unwrap().unwrap();
        scheduler.queue().block(item.id()).unwrap();
        runner
    }

    fn scheduler() -> Scheduler {
        Scheduler::new(Arc::new(MemoryStore::new()), &SchedulerConfig::default())
    }

    #[test]
    fn test_created_node_is_cached_and_unblocks() {
        let scheduler = scheduler();
        let runner = blocked_runner(&scheduler);
        let n = node("host-1");

        scheduler.notify_node_created(n.clone());
        assert!(scheduler.cache().contains(n.id));
        assert!(!scheduler.queue().is_blocked(runner.id));
        assert_eq!(scheduler.queue().len(), 1);
    }

    #[test]
    fn test_update_for_unknown_node_does_not_insert() {
        let scheduler = scheduler();
        let runner = blocked_runner(&scheduler);
        let n = node("ghost");

        scheduler.notify_node_updated(n.clone());
        assert!(!scheduler.cache().contains(n.id));
        assert!(!scheduler.queue().is_blocked(runner.id));
    }

    #[test]
    fn test_update_replaces_cached_node() {
        let scheduler = scheduler();
        let mut n = node("host-1");
        scheduler.notify_node_created(n.clone());

        n.is_cordoned = true;
        scheduler.notify_node_updated(n.clone());
        assert!(scheduler.cache().get_node(n.id).unwrap().is_cordoned);
    }

    #[test]
    fn test_deleted_node_leaves_cache_and_unblocks() {
        let scheduler = scheduler();
        let n = node("host-1");
        scheduler.notify_node_created(n.clone());
        let runner = blocked_runner(&scheduler);

        scheduler.notify_node_deleted(n.clone());
        assert!(scheduler.cache().is_empty());
        assert!(!scheduler.queue().is_blocked(runner.id));

        // Deleting twice is harmless.
        scheduler.notify_node_deleted(n);
        assert!(scheduler.cache().is_empty());
    }
}

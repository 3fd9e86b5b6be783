//! Analyzer registry
//!
//! Catalog of analyzer kinds: tag, name, factory, enabled flag. The
//! registry is written at startup and read on every new connection, so
//! enable/disable is a plain flag flip and all lookups are map hits.

use std::collections::HashMap;

use tracing::debug;

use crate::core::connection::Connection;
use crate::errors::{Error, Result};
use crate::runtime::Reporter;

use super::ports::PortTable;
use super::{Analyzer, AnalyzerComponent, AnalyzerFactory, AnalyzerTag};

pub struct AnalyzerRegistry {
    components: Vec<AnalyzerComponent>,
    by_tag: HashMap<AnalyzerTag, usize>,
    by_name: HashMap<&'static str, usize>,
    next_raw: u32,
}

impl AnalyzerRegistry {
    pub fn new() -> Self {
        Self {
            components: Vec::new(),
            by_tag: HashMap::new(),
            by_name: HashMap::new(),
            next_raw: 1,
        }
    }

    /// Register a component. Fails if the tag or name is already taken.
    pub fn register(&mut self, component: AnalyzerComponent) -> Result<()> {
        if self.by_tag.contains_key(&component.tag) || self.by_name.contains_key(component.name) {
            return Err(Error::DuplicateComponent(component.name.to_string()));
        }

        let idx = self.components.len();
        self.by_tag.insert(component.tag, idx);
        self.by_name.insert(component.name, idx);
        self.next_raw = self.next_raw.max(component.tag.raw().saturating_add(1));
        self.components.push(component);
        Ok(())
    }

    /// Register a factory under a fresh tag and hand the tag back.
    pub fn register_factory(
        &mut self,
        name: &'static str,
        factory: AnalyzerFactory,
    ) -> Result<AnalyzerTag> {
        let tag = AnalyzerTag::new(self.next_raw);
        self.register(AnalyzerComponent::new(tag, name, Some(factory)))?;
        Ok(tag)
    }

    pub fn lookup(&self, tag: AnalyzerTag) -> Option<&AnalyzerComponent> {
        self.by_tag.get(&tag).map(|&idx| &self.components[idx])
    }

    pub fn lookup_by_name(&self, name: &str) -> Option<&AnalyzerComponent> {
        self.by_name.get(name).map(|&idx| &self.components[idx])
    }

    pub fn tag_of(&self, name: &str) -> Option<AnalyzerTag> {
        self.lookup_by_name(name).map(|c| c.tag)
    }

    pub fn name_of(&self, tag: AnalyzerTag) -> &'static str {
        self.lookup(tag).map(|c| c.name).unwrap_or("<unknown>")
    }

    /// Enable an analyzer kind. Returns whether the component exists.
    pub fn enable(&mut self, tag: AnalyzerTag) -> bool {
        let Some(&idx) = self.by_tag.get(&tag) else {
            return false;
        };
        debug!("enabling analyzer {}", self.components[idx].name);
        self.components[idx].enabled = true;
        true
    }

    /// Disable an analyzer kind. Returns whether the component exists.
    pub fn disable(&mut self, tag: AnalyzerTag) -> bool {
        let Some(&idx) = self.by_tag.get(&tag) else {
            return false;
        };
        debug!("disabling analyzer {}", self.components[idx].name);
        self.components[idx].enabled = false;
        true
    }

    pub fn disable_all(&mut self) {
        debug!("disabling all analyzers");
        for c in &mut self.components {
            c.enabled = false;
        }
    }

    pub fn is_enabled(&self, tag: AnalyzerTag) -> bool {
        self.lookup(tag).map(|c| c.enabled).unwrap_or(false)
    }

    /// Construct an analyzer for a connection.
    ///
    /// Returns `None` when the tag is unknown (a programming error,
    /// reported), the component is disabled (normal, silent), or the
    /// component has no factory (reported). The instance is stamped
    /// with its originating tag.
    pub fn instantiate(
        &self,
        tag: AnalyzerTag,
        conn: &Connection,
        reporter: &Reporter,
    ) -> Option<Box<dyn Analyzer>> {
        let Some(component) = self.lookup(tag) else {
            reporter.internal_warning("request to instantiate unknown analyzer");
            return None;
        };

        if !component.enabled {
            return None;
        }

        let Some(factory) = component.factory else {
            reporter.internal_warning(&format!(
                "analyzer {} cannot be instantiated dynamically",
                component.name
            ));
            return None;
        };

        let Some(mut analyzer) = factory(conn) else {
            reporter.internal_warning(&format!(
                "analyzer {} instantiation failed",
                component.name
            ));
            return None;
        };

        analyzer.set_tag(tag);
        Some(analyzer)
    }

    /// Construct by name; unknown names are a silent `None`.
    pub fn instantiate_by_name(
        &self,
        name: &str,
        conn: &Connection,
        reporter: &Reporter,
    ) -> Option<Box<dyn Analyzer>> {
        let tag = self.tag_of(name)?;
        self.instantiate(tag, conn, reporter)
    }

    pub fn components(&self) -> impl Iterator<Item = &AnalyzerComponent> {
        self.components.iter()
    }

    pub fn len(&self) -> usize {
        self.components.len()
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    /// Log the catalog and the port maps at debug level.
    pub fn dump_debug(&self, ports: &PortTable) {
        debug!("available analyzers:");
        for c in &self.components {
            debug!(
                "    {} ({})",
                c.name,
                if c.enabled { "enabled" } else { "disabled" }
            );
        }

        debug!("analyzers by port:");
        for (port, tags) in ports.tcp_entries() {
            let names: Vec<&str> = tags.iter().map(|&t| self.name_of(t)).collect();
            debug!("    {}/tcp: {}", port, names.join(" "));
        }
        for (port, tags) in ports.udp_entries() {
            let names: Vec<&str> = tags.iter().map(|&t| self.name_of(t)).collect();
            debug!("    {}/udp: {}", port, names.join(" "));
        }
    }
}

impl Default for AnalyzerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::connection::ConnKey;
    use crate::core::packet::{ConnTuple, TcpFlags, Transport};
    use crate::core::time::NetworkTime;
    use std::net::{IpAddr, Ipv4Addr};

    struct NullAnalyzer {
        tag: AnalyzerTag,
    }

    impl Analyzer for NullAnalyzer {
        fn tag(&self) -> AnalyzerTag {
            self.tag
        }
        fn set_tag(&mut self, tag: AnalyzerTag) {
            self.tag = tag;
        }
    }

    fn null_factory(_conn: &Connection) -> Option<Box<dyn Analyzer>> {
        Some(Box::new(NullAnalyzer {
            tag: AnalyzerTag::NONE,
        }))
    }

    fn test_conn() -> Connection {
        let tuple = ConnTuple {
            src_addr: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            dst_addr: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
            src_port: 44321,
            dst_port: 80,
            transport: Transport::Tcp,
        };
        Connection::new(
            1,
            ConnKey::from_tuple(&tuple),
            &tuple,
            NetworkTime::from_secs(0.0),
            0,
            Some(TcpFlags::SYN),
        )
    }

    #[test]
    fn test_register_and_lookup() {
        let mut registry = AnalyzerRegistry::new();
        let http = registry.register_factory("HTTP", null_factory).unwrap();
        let ssh = registry.register_factory("SSH", null_factory).unwrap();

        assert_ne!(http, ssh);
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.tag_of("HTTP"), Some(http));
        assert_eq!(registry.name_of(ssh), "SSH");
        assert!(registry.lookup_by_name("SMB").is_none());
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let mut registry = AnalyzerRegistry::new();
        registry.register_factory("HTTP", null_factory).unwrap();
        assert!(registry.register_factory("HTTP", null_factory).is_err());

        let taken = registry.tag_of("HTTP").unwrap();
        let dup = AnalyzerComponent::new(taken, "OTHER", None);
        assert!(registry.register(dup).is_err());
    }

    #[test]
    fn test_enable_disable_idempotent() {
        let mut registry = AnalyzerRegistry::new();
        let tag = registry.register_factory("HTTP", null_factory).unwrap();

        assert!(registry.is_enabled(tag));
        assert!(registry.disable(tag));
        assert!(registry.disable(tag));
        assert!(!registry.is_enabled(tag));
        assert!(registry.enable(tag));
        assert!(registry.enable(tag));
        assert!(registry.is_enabled(tag));

        // Unknown tag: false, never an error.
        assert!(!registry.enable(AnalyzerTag::new(9999)));
        assert!(!registry.disable(AnalyzerTag::new(9999)));
    }

    #[test]
    fn test_disable_all() {
        let mut registry = AnalyzerRegistry::new();
        let a = registry.register_factory("A", null_factory).unwrap();
        let b = registry.register_factory("B", null_factory).unwrap();

        registry.disable_all();
        assert!(!registry.is_enabled(a));
        assert!(!registry.is_enabled(b));
    }

    #[test]
    fn test_instantiate_paths() {
        let mut registry = AnalyzerRegistry::new();
        let reporter = Reporter::new();
        let conn = test_conn();

        let tag = registry.register_factory("HTTP", null_factory).unwrap();
        let a = registry.instantiate(tag, &conn, &reporter).unwrap();
        assert_eq!(a.tag(), tag);

        // Disabled: silent None.
        registry.disable(tag);
        let before = reporter.internal_warning_count();
        assert!(registry.instantiate(tag, &conn, &reporter).is_none());
        assert_eq!(reporter.internal_warning_count(), before);

        // Unknown tag: reported.
        assert!(registry
            .instantiate(AnalyzerTag::new(777), &conn, &reporter)
            .is_none());
        assert_eq!(reporter.internal_warning_count(), before + 1);

        // No factory: reported.
        let bare = AnalyzerTag::new(500);
        registry
            .register(AnalyzerComponent::new(bare, "STATIC", None))
            .unwrap();
        assert!(registry.instantiate(bare, &conn, &reporter).is_none());
        assert_eq!(reporter.internal_warning_count(), before + 2);
    }

    #[test]
    fn test_instantiate_by_name() {
        let mut registry = AnalyzerRegistry::new();
        let reporter = Reporter::new();
        let conn = test_conn();

        registry.register_factory("HTTP", null_factory).unwrap();
        assert!(registry
            .instantiate_by_name("HTTP", &conn, &reporter)
            .is_some());

        // Unknown name: silent None.
        let before = reporter.internal_warning_count();
        assert!(registry
            .instantiate_by_name("NOPE", &conn, &reporter)
            .is_none());
        assert_eq!(reporter.internal_warning_count(), before);
    }
}

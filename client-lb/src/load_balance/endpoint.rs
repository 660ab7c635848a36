use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use http::Uri;
use http::uri::Authority;

use crate::Result;
use crate::discovery::{Instance, InstanceStatus};
use crate::error::LbError;

struct ServerInner {
    transport: String,
    authority: Authority,
    endpoint: String,
    instance: Arc<Instance>,
    ready_to_serve: bool,
}

/// One reachable address of an instance.
///
/// Two servers are equal when they belong to the same instance, whatever
/// address they point at.
#[derive(Clone)]
pub struct Server(Arc<ServerInner>);

impl Server {
    /// Parses a `transport://host:port[?params]` endpoint of `instance`.
    pub fn parse(endpoint: &str, instance: Arc<Instance>) -> Result<Self> {
        let uri: Uri = endpoint
            .parse()
            .map_err(|e| LbError::InvalidEndpoint(format!("{}: {}", endpoint, e)))?;
        let transport = uri
            .scheme_str()
            .ok_or_else(|| LbError::InvalidEndpoint(format!("{}: missing transport", endpoint)))?
            .to_string();
        let authority = uri
            .authority()
            .cloned()
            .ok_or_else(|| LbError::InvalidEndpoint(format!("{}: missing host", endpoint)))?;

        let ready_to_serve = instance.status == InstanceStatus::Up;
        Ok(Self(Arc::new(ServerInner {
            transport,
            authority,
            endpoint: endpoint.to_string(),
            instance,
            ready_to_serve,
        })))
    }

    /// First parseable endpoint of `instance`, optionally restricted to a transport.
    pub fn from_instance(instance: Arc<Instance>, transport: Option<&str>) -> Result<Self> {
        instance
            .endpoints
            .iter()
            .filter_map(|e| Server::parse(e, instance.clone()).ok())
            .find(|s| transport.is_none_or(|t| s.transport() == t))
            .ok_or_else(|| {
                LbError::InvalidEndpoint(format!("instance {} has no usable endpoint", instance.instance_id))
            })
    }

    pub fn instance_id(&self) -> &str {
        &self.0.instance.instance_id
    }

    pub fn instance(&self) -> &Arc<Instance> {
        &self.0.instance
    }

    pub fn transport(&self) -> &str {
        &self.0.transport
    }

    pub fn authority(&self) -> &Authority {
        &self.0.authority
    }

    /// The endpoint as discovery reported it.
    pub fn endpoint(&self) -> &str {
        &self.0.endpoint
    }

    pub fn is_ready_to_serve(&self) -> bool {
        self.0.ready_to_serve
    }
}

impl PartialEq for Server {
    fn eq(&self, other: &Self) -> bool {
        self.instance_id() == other.instance_id()
    }
}

impl Eq for Server {}

impl Hash for Server {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.instance_id().hash(state);
    }
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("instance_id", &self.instance_id())
            .field("endpoint", &self.endpoint())
            .finish()
    }
}

impl fmt::Display for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}://{}", self.instance_id(), self.transport(), self.authority())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    fn instance(id: &str) -> Arc<Instance> {
        Arc::new(
            Instance::new(id)
                .with_endpoint("rest://10.0.0.1:8080?sslEnabled=false")
                .with_endpoint("highway://10.0.0.1:7070"),
        )
    }

    #[test]
    fn test_parse() {
        let server = Server::parse("rest://10.0.0.1:8080?sslEnabled=false", instance("a")).unwrap();
        assert_eq!(server.transport(), "rest");
        assert_eq!(server.authority().host(), "10.0.0.1");
        assert_eq!(server.authority().port_u16(), Some(8080));
        assert_eq!(server.to_string(), "a@rest://10.0.0.1:8080");
        assert!(server.is_ready_to_serve());
    }

    #[test]
    fn test_parse_rejects_bare_hosts() {
        let err = Server::parse("10.0.0.1:8080", instance("a")).unwrap_err();
        assert!(matches!(err, LbError::InvalidEndpoint(_)));
        assert!(Server::parse("not an endpoint", instance("a")).is_err());
    }

    #[test]
    fn test_equality_by_instance() {
        let inst = instance("a");
        let rest = Server::from_instance(inst.clone(), Some("rest")).unwrap();
        let highway = Server::from_instance(inst, Some("highway")).unwrap();
        assert_ne!(rest.authority(), highway.authority());
        assert_eq!(rest, highway);

        let set: HashSet<Server> = [rest, highway].into_iter().collect();
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_from_instance_without_transport() {
        let err = Server::from_instance(instance("a"), Some("grpc")).unwrap_err();
        assert!(matches!(err, LbError::InvalidEndpoint(_)));
    }
}

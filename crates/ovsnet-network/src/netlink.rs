//! Kernel link operations: the [`LinkOps`] seam and its rtnetlink implementation

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::TryStreamExt;
use netlink_packet_route::address::AddressAttribute;
use netlink_packet_route::link::LinkAttribute;
use rtnetlink::{new_connection, Handle};
use std::net::IpAddr;
use tracing::debug;

/// IP address on an interface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterfaceAddress {
    pub address: IpAddr,
    pub prefix_len: u8,
}

impl InterfaceAddress {
    pub fn is_ipv4(&self) -> bool {
        self.address.is_ipv4()
    }
}

/// The kernel's view of network interfaces in the default namespace
#[async_trait]
pub trait LinkOps: Send + Sync {
    async fn list_links(&self) -> Result<Vec<String>>;

    async fn link_exists(&self, name: &str) -> Result<bool> {
        Ok(self.list_links().await?.iter().any(|l| l == name))
    }

    async fn addresses(&self, name: &str) -> Result<Vec<InterfaceAddress>>;

    async fn ipv4_addresses(&self, name: &str) -> Result<Vec<InterfaceAddress>> {
        Ok(self
            .addresses(name)
            .await?
            .into_iter()
            .filter(InterfaceAddress::is_ipv4)
            .collect())
    }

    async fn add_address(&self, name: &str, address: IpAddr, prefix_len: u8) -> Result<()>;

    async fn set_up(&self, name: &str) -> Result<()>;

    /// Create a connected veth pair `name` <-> `peer`.
    async fn create_veth(&self, name: &str, peer: &str) -> Result<()>;

    /// Delete a link; deleting one end of a veth pair removes both.
    async fn delete_link(&self, name: &str) -> Result<()>;
}

/// [`LinkOps`] over rtnetlink, one netlink connection per call
#[derive(Debug, Default, Clone, Copy)]
pub struct RtnetlinkLinks;

impl RtnetlinkLinks {
    pub fn new() -> Self {
        Self
    }

    fn connect() -> Result<Handle> {
        let (connection, handle, _) = new_connection().context("Failed to open netlink socket")?;
        tokio::spawn(connection);
        Ok(handle)
    }

    async fn index_of(handle: &Handle, name: &str) -> Result<u32> {
        let mut links = handle.link().get().match_name(name.to_string()).execute();
        let link = links
            .try_next()
            .await
            .with_context(|| format!("Interface '{}' not found", name))?
            .with_context(|| format!("Interface '{}' not found", name))?;
        Ok(link.header.index)
    }
}

#[async_trait]
impl LinkOps for RtnetlinkLinks {
    async fn list_links(&self) -> Result<Vec<String>> {
        let handle = Self::connect()?;
        let mut names = Vec::new();
        let mut links = handle.link().get().execute();
        while let Some(link) = links.try_next().await? {
            for attr in &link.attributes {
                if let LinkAttribute::IfName(n) = attr {
                    names.push(n.clone());
                }
            }
        }
        Ok(names)
    }

    async fn addresses(&self, name: &str) -> Result<Vec<InterfaceAddress>> {
        let handle = Self::connect()?;
        let ifindex = Self::index_of(&handle, name).await?;

        let mut addresses = Vec::new();
        let mut addr_stream = handle
            .address()
            .get()
            .set_link_index_filter(ifindex)
            .execute();
        while let Some(addr_msg) = addr_stream.try_next().await? {
            for attr in &addr_msg.attributes {
                if let AddressAttribute::Address(address) = attr {
                    addresses.push(InterfaceAddress {
                        address: *address,
                        prefix_len: addr_msg.header.prefix_len,
                    });
                }
            }
        }
        Ok(addresses)
    }

    async fn add_address(&self, name: &str, address: IpAddr, prefix_len: u8) -> Result<()> {
        let handle = Self::connect()?;
        let ifindex = Self::index_of(&handle, name).await?;
        handle
            .address()
            .add(ifindex, address, prefix_len)
            .execute()
            .await
            .context("Failed to add IP address")?;
        debug!("Added {}/{} to {}", address, prefix_len, name);
        Ok(())
    }

    async fn set_up(&self, name: &str) -> Result<()> {
        let handle = Self::connect()?;
        let ifindex = Self::index_of(&handle, name).await?;
        handle
            .link()
            .set(ifindex)
            .up()
            .execute()
            .await
            .context("Failed to bring link up")?;
        Ok(())
    }

    async fn create_veth(&self, name: &str, peer: &str) -> Result<()> {
        let handle = Self::connect()?;
        handle
            .link()
            .add()
            .veth(name.to_string(), peer.to_string())
            .execute()
            .await
            .with_context(|| format!("Failed to create veth pair {} <-> {}", name, peer))?;
        debug!("Created veth pair {} <-> {}", name, peer);
        Ok(())
    }

    async fn delete_link(&self, name: &str) -> Result<()> {
        let handle = Self::connect()?;
        let ifindex = Self::index_of(&handle, name).await?;
        handle
            .link()
            .del(ifindex)
            .execute()
            .await
            .with_context(|| format!("Failed to delete link {}", name))?;
        Ok(())
    }
}

use anyhow::anyhow;
use futures::TryStreamExt;
use netlink_packet_route::link::LinkMessage;
use rtnetlink::{Handle, new_connection};

/// Establishes an rtnetlink connection and returns a handle.
/// Returns `Ok(Some(Handle))` if successful, or an error otherwise.
pub fn get_handle() -> anyhow::Result<Option<Handle>> {
    let (connection, handle, _) =
        new_connection().map_err(|e| anyhow!("Failed to create rtnetlink connection: {}", e))?;
    tokio::spawn(connection);
    Ok(Some(handle))
}

/// Retrieves a link (network interface) by its index.
///
/// # Arguments
/// * `index` - The index of the network interface.
///
/// # Returns
/// * `Ok(Some(LinkMessage))` if found.
/// * `Ok(None)` if the interface does not exist.
/// * `Err(anyhow::Error)` if an error occurs.
pub async fn link_by_index(index: u32) -> anyhow::Result<LinkMessage> {
    let handle = get_handle()?.ok_or_else(|| anyhow!("Cannot get handle"))?;

    let mut links = handle.link().get().match_index(index).execute();

    let link = links
        .try_next()
        .await?
        .ok_or_else(|| anyhow!("Link with index {} not found", index))?;

    Ok(link)
}

/// Retrieves a link (network interface) by its name.
///
/// # Arguments
/// * `name` - The name of the network interface.
///
/// # Returns
/// * `Ok(Some(LinkMessage))` if found.
/// * `Ok(None)` if the interface does not exist.
/// * `Err(anyhow::Error)` if an error occurs.
pub async fn link_by_name(name: &str) -> anyhow::Result<LinkMessage> {
    let handle = get_handle()?.ok_or_else(|| anyhow!("Cannot get handle"))?;

    let mut links = handle.link().get().match_name(name.to_string()).execute();

    let link = links
        .try_next()
        .await?
        .ok_or_else(|| anyhow!("Link with name {} not found", name))?;

    Ok(link)
}

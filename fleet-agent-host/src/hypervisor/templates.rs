//! libvirt definition documents for Ceph secrets and RBD pools

use super::Monitor;
use crate::model::StoragePool;

fn escape(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '\'' => escaped.push_str("&apos;"),
            '"' => escaped.push_str("&quot;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

/// Ceph usage secret referenced by the pool's `<auth>` element
pub fn secret_xml(pool: &StoragePool) -> String {
    format!(
        "<secret ephemeral='no' private='no'>\n  \
           <uuid>{uuid}</uuid>\n  \
           <usage type='ceph'>\n    \
             <name>client.{user} secret for {pool}</name>\n  \
           </usage>\n\
         </secret>\n",
        uuid = escape(&pool.secret_uuid),
        user = escape(&pool.auth_user),
        pool = escape(pool.hypervisor_name()),
    )
}

/// RBD pool with one `<host>` per monitor
pub fn pool_xml(pool: &StoragePool, monitors: &[Monitor]) -> String {
    let hosts: String = monitors
        .iter()
        .map(|m| format!("    <host name='{}' port='{}'/>\n", escape(&m.address), m.port))
        .collect();

    format!(
        "<pool type='rbd'>\n  \
           <name>{name}</name>\n  \
           <source>\n    \
             <name>{rbd}</name>\n\
         {hosts}    \
             <auth type='ceph' username='{user}'>\n      \
               <secret uuid='{uuid}'/>\n    \
             </auth>\n  \
           </source>\n\
         </pool>\n",
        name = escape(pool.hypervisor_name()),
        rbd = escape(&pool.rbd_source_name),
        hosts = hosts,
        user = escape(&pool.auth_user),
        uuid = escape(&pool.secret_uuid),
    )
}

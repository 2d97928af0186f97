/// A snapshot of a virtual NIC as reported by the virtualization platform.
///
/// NICs are never written by the controller; they only drive the desired
/// state of the rules derived from them.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Nic {
    pub id: String,
    pub dpi_enabled: bool,
    pub mac_address: String,
    pub owner_vm_id: String,
}

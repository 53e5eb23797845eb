tonic::include_proto!("nilis");

pub const FILE_DESCRIPTOR_SET: &[u8] =
    tonic::include_file_descriptor_set!("nilis_descriptor");

/// Metadata key marking a request that was already proxied once by a peer.
pub const FORWARDED_HEADER: &str = "x-nilis-forwarded";

impl Mutation {
    #[inline]
    pub fn is_delete(&self) -> bool {
        self.op() == MutationOp::Delete
    }
}

//! ActivityPub federation module
//!
//! Handles:
//! - HTTP Signatures
//! - WebFinger discovery and actor document fetches
//! - Actor resolution and caching
//! - Inbox processing
//! - Activity delivery
//! - Outbox pagination
//! - Actor key provisioning

mod activity;
mod actor_cache;
mod delivery;
mod guard;
mod keys;
mod outbox;
mod resolver;
mod signature;
mod webfinger;

pub use activity::{
    AS_CONTEXT, AS_PUBLIC, AcceptTask, ActivityEnvelope, ActivityType, ActorRef, InboxOutcome,
    InboxProcessor, object_id,
};
pub use actor_cache::ActorCache;
pub use delivery::{ActivityDelivery, DeliveryResult, LocalSigner, builder};
pub use guard::{authority_of, check_outbound_url};
pub use keys::{
    AesGcmKeyVault, KeyPair, KeyVault, PublicKeyBlock, generate_key_pair, main_key_id,
    unseal_private_key,
};
pub use outbox::{OutboxPager, OutboxQuery, create_activity, fetch_remote_outbox};
pub use resolver::{Actor, ActorIdentifier, ActorResolver, project_remote_actor};
pub use signature::{
    ParsedSignature, SignatureHeaders, generate_digest, key_id_actor_url, parse_signature_header,
    sign_request, verify_request, verify_signature,
};
pub use webfinger::{
    ACTIVITY_JSON, ActorDocument, DiscoveryClient, JRD_JSON, LD_JSON_PROFILE, WebFingerLink,
    WebFingerResponse, generate_webfinger_response, parse_acct_resource,
};

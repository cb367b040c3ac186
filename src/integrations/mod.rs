//! Hosted identity backends.

pub mod supabase;

pub use supabase::{SupabaseClient, SupabaseConfig, SupabaseIdentity, SupabaseProfiles};

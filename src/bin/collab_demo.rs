//! Two editors on one entry, against the in-process backend.
//!
//! Run with: cargo run --bin collab_demo [config.json]
//! Set RUST_LOG=debug to see the sync layer's logging.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use quire::document::LocalActivity;
use quire::entity::Entry;
use quire::ot::MemoryBackend;
use quire::warnings::declined;
use quire::{
    ContentType, Document, DocumentOptions, Entity, EntityActions, EntityType, FieldSpec, Locale,
    PublicationWarnings, RateLimitedClient, SyncConfig, SysMetadata, UserRef, Warning,
};
use serde_json::json;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let config = match std::env::args().nth(1) {
        Some(path) => SyncConfig::load(path)?,
        None => SyncConfig::default(),
    };

    println!("\n📝 Quire collaborative editing demo");
    println!("===================================");

    let backend = MemoryBackend::new("demo-space").with_event_buffer(config.document.event_buffer);
    let entity_ref = backend.seed(Entity::Entry(Entry {
        sys: SysMetadata::new("welcome", EntityType::Entry, 1),
        content_type_id: "post".into(),
        fields: json!({
            "title": {"en-US": "Hello", "fr-FR": "Bonjour"},
            "tags": {"en-US": ["news"]},
            "retired": {"en-US": "left over from an old schema"}
        }),
    }));

    let activity = LocalActivity::create();
    let options = DocumentOptions {
        config: config.clone(),
        activity: Some(Arc::clone(&activity)),
    };
    let alice = Document::open(
        &backend.connect(UserRef::named("alice", "Alice")),
        entity_ref.clone(),
        options.clone(),
    )
    .await?;
    let bob = Document::open(
        &backend.connect(UserRef::named("bob", "Bob")),
        entity_ref.clone(),
        options,
    )
    .await?;

    let content_type = ContentType::new(
        "post",
        vec![FieldSpec::new("title", "Symbol"), FieldSpec::new("tags", "Array")],
    );
    let report = alice.set_schema(Some(content_type), vec![Locale::new("en-US")]).await?;
    println!(
        "🧹 Alice's view hides fields {:?} and locales {:?}",
        report.removed_fields, report.removed_locales
    );

    let bob_title = bob.field_locale("title", "en-US");
    let mut bob_sees = bob_title.value_property().subscribe();
    println!("👀 Bob sees title {:?}", bob_sees.next().await.flatten());

    let alice_title = alice.field_locale("title", "en-US");
    alice_title.notify_focus();
    alice_title.set(json!("Hello, world")).await?;
    println!("✏️  Alice set the title (version {})", alice.sys().version);

    if let Ok(Some(value)) = tokio::time::timeout(Duration::from_secs(1), bob_sees.next()).await {
        println!("👀 Bob sees title {:?}", value);
    }
    println!(
        "👥 Collaborators in Bob's title field: {:?}",
        bob_title.collaborators().get().iter().map(|u| u.id.as_str()).collect::<Vec<_>>()
    );

    bob.field_locale("tags", "en-US").push(json!("featured")).await?;
    println!("🏷️  Bob added a tag (version {})", bob.sys().version);

    // Let Alice catch up before she acts on the entry as a whole.
    let target = bob.sys().version;
    let mut alice_sys = alice.sys_property().subscribe();
    while let Some(sys) = alice_sys.next().await {
        if sys.version >= target {
            break;
        }
    }

    let client = Arc::new(RateLimitedClient::new(Arc::new(backend.client()), config.queue.clone()));
    let warnings = PublicationWarnings::new();
    let actions = EntityActions::for_document(alice.clone(), client, warnings.clone())?;

    let veto = warnings.register(
        Warning::new(|_| async { Err::<(), _>(declined("reviewer asked to wait")) })
            .in_group("review")
            .with_priority(10),
    );
    match actions.publish().await {
        Ok(_) => println!("🚀 Published"),
        Err(e) => println!("⛔ Publish stopped: {e}"),
    }
    veto.unregister();

    let published = actions.publish().await?;
    println!("🚀 Published version {:?}", published.sys().published_version);

    alice_title.set(json!("Hello again")).await?;
    println!(
        "↩️  Can revert to previous: {}, to published: {}",
        actions.reverter().can_revert_to_previous(),
        actions.reverter().can_revert_to_published()
    );
    actions.revert_to_published().await?;
    println!("↩️  Reverted to published, title is {:?}", alice_title.get());

    activity.destroy();
    alice.close().await?;
    bob.close().await?;
    println!("✅ Done, {} sessions left open", backend.session_count(&entity_ref));
    Ok(())
}

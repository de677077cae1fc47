//! Fleet reactions to session lifecycle events.

#![allow(clippy::unwrap_used, clippy::missing_panics_doc)]

mod common;

use std::sync::atomic::Ordering;

use tokio::sync::broadcast;

use mailbridge_core::remote::{AddressEvent, MessageEvent};
use mailbridge_core::{
    AccountNotice, Address, AddressId, AddressMode, BindingToken, Cursor, Error, RemoteEvent,
    SessionEvent, UserId, Vault,
};

use common::{USER, eventually, fleet, harness, message, settled, two_addresses, within};

fn bad_event() -> RemoteEvent {
    RemoteEvent {
        cursor: Cursor::new("c-1"),
        messages: vec![MessageEvent::Created(message("m1", "unknown"))],
        ..RemoteEvent::default()
    }
}

async fn logged_out(notices: &mut broadcast::Receiver<AccountNotice>) -> (UserId, bool) {
    within(async {
        loop {
            if let AccountNotice::LoggedOut { user_id, forced } = notices.recv().await.unwrap() {
                return (user_id, forced);
            }
        }
    })
    .await
}

fn address_event(cursor: &str, change: AddressEvent) -> RemoteEvent {
    let mut ev = RemoteEvent {
        cursor: Cursor::new(cursor),
        ..RemoteEvent::default()
    };
    ev.addresses.push(change);
    ev
}

fn disabled(id: &str, email: &str, order: u32) -> Address {
    let mut addr = Address::new(id, email, order);
    addr.enabled = false;
    addr
}

#[tokio::test]
async fn combined_account_registers_its_primary_address() {
    let h = harness(two_addresses(), AddressMode::Combined).await;
    let (registry, server, _reporter) = fleet(&h).await;

    assert_eq!(server.registered_addresses(), vec![AddressId::new("a")]);
    assert_eq!(h.session.bindings().len(), 1);
    assert_eq!(registry.user_ids(), vec![UserId::new(USER)]);

    let again = registry.add_account(h.session.clone()).await.unwrap_err();
    assert_eq!(again.kind(), "AlreadyExists");
}

#[tokio::test]
async fn mode_switch_reregisters_every_address() {
    let h = harness(two_addresses(), AddressMode::Combined).await;
    let (registry, server, _reporter) = fleet(&h).await;
    let user = UserId::new(USER);

    registry.set_address_mode(&user, AddressMode::Split).await.unwrap();

    assert_eq!(
        server.registered_addresses(),
        vec![AddressId::new("a"), AddressId::new("b")]
    );
    assert_eq!(server.deprovisioned.lock().unwrap().len(), 1);
    assert!(server.deprovisioned.lock().unwrap()[0].1);
    assert_eq!(h.session.bindings().len(), 2);
    assert_eq!(h.session.address_mode(), AddressMode::Split);

    // Same mode again is a no-op.
    registry.set_address_mode(&user, AddressMode::Split).await.unwrap();
    assert_eq!(server.deprovisioned.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn failed_mode_switch_keeps_registrations() {
    let h = harness(two_addresses(), AddressMode::Combined).await;
    let (registry, server, _reporter) = fleet(&h).await;
    settled(&h.session).await;
    let binding = h.session.binding(&AddressId::new("a")).unwrap();
    h.flaky.fail_set_mode.store(true, Ordering::SeqCst);

    let err = registry
        .set_address_mode(&UserId::new(USER), AddressMode::Split)
        .await
        .unwrap_err();

    assert_eq!(err.kind(), "Config");
    assert_eq!(h.session.address_mode(), AddressMode::Combined);
    assert_eq!(server.registered_addresses(), vec![AddressId::new("a")]);
    assert!(server.deprovisioned.lock().unwrap().is_empty());
    assert_eq!(h.session.bindings().len(), 1);
    assert_eq!(h.session.binding(&AddressId::new("a")), Some(binding));
}

#[tokio::test]
async fn declined_repair_forces_logout_and_keeps_the_vault() {
    let h = harness(two_addresses(), AddressMode::Combined).await;
    let (registry, _server, reporter) = fleet(&h).await;
    let mut notices = registry.subscribe();
    settled(&h.session).await;

    h.remote.push(Ok(bad_event())).await;

    let (user_id, forced) = logged_out(&mut notices).await;
    assert_eq!(user_id, UserId::new(USER));
    assert!(forced);

    assert_eq!(reporter.messages(), vec!["Failed to handle event: logout".to_string()]);
    let (_, context) = reporter.reports.lock().unwrap()[0].clone();
    assert_eq!(context["user_id"], USER);
    assert_eq!(context["old_event_id"], "c-0");
    assert_eq!(context["new_event_id"], "c-1");
    assert_eq!(context["error_type"], "NotFound");
    assert!(context["event_info"].as_str().unwrap().contains("m1"));

    assert_eq!(h.remote.revoked.load(Ordering::SeqCst), 1);
    assert!(registry.account(&UserId::new(USER)).is_none());
    assert!(h.session.is_closed());

    // Forced logout keeps local state for the next login.
    let reopened = h.store.open_user(&UserId::new(USER)).await.unwrap();
    assert_eq!(reopened.event_cursor(), Some(Cursor::new("c-0")));
    assert_eq!(reopened.bindings().len(), 1);
}

#[tokio::test]
async fn approved_repair_resyncs_from_the_latest_cursor() {
    let h = harness(two_addresses(), AddressMode::Combined).await;
    let (registry, _server, reporter) = fleet(&h).await;
    registry
        .set_bad_event_feedback(&UserId::new(USER), true)
        .unwrap();
    settled(&h.session).await;
    h.remote.set_latest_cursor("c-5");

    h.remote.push(Ok(bad_event())).await;

    eventually("event loop restarted", || {
        h.remote.stream_count() == 2 && h.session.is_consuming_events()
    })
    .await;

    assert_eq!(h.remote.stream_starts.lock().unwrap()[1], Cursor::new("c-5"));
    assert_eq!(h.vault.event_cursor(), Some(Cursor::new("c-5")));
    assert_eq!(reporter.messages(), vec!["Failed to handle event: repair".to_string()]);
    assert_eq!(h.remote.revoked.load(Ordering::SeqCst), 0);
    assert!(registry.account(&UserId::new(USER)).is_some());
}

#[tokio::test]
async fn failed_repair_reports_twice_and_logs_out() {
    let h = harness(two_addresses(), AddressMode::Combined).await;
    let (registry, _server, reporter) = fleet(&h).await;
    registry
        .set_bad_event_feedback(&UserId::new(USER), true)
        .unwrap();
    let mut notices = registry.subscribe();
    settled(&h.session).await;
    h.remote.fail_latest_cursor.store(true, Ordering::SeqCst);

    h.remote.push(Ok(bad_event())).await;

    let (_, forced) = logged_out(&mut notices).await;
    assert!(forced);
    assert_eq!(
        reporter.messages(),
        vec![
            "Failed to handle event: repair".to_string(),
            "Failed to handle event: repair failed: logging out".to_string(),
        ]
    );
    let (_, context) = reporter.reports.lock().unwrap()[1].clone();
    assert_eq!(context["error_type"], "Remote");
    assert!(context["error"].as_str().unwrap().contains("cursor unavailable"));
    assert_eq!(context["new_event_id"], "c-1");

    assert_eq!(h.remote.revoked.load(Ordering::SeqCst), 1);
    assert!(registry.account(&UserId::new(USER)).is_none());
    assert!(h.session.is_closed());
}

#[tokio::test]
async fn bad_event_feedback_needs_a_known_account() {
    let h = harness(two_addresses(), AddressMode::Combined).await;
    let (registry, _server, _reporter) = fleet(&h).await;

    let err = registry
        .set_bad_event_feedback(&UserId::new("stranger"), true)
        .unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn deleting_an_unbound_address_is_not_found() {
    let h = harness(
        vec![
            Address::new("a", "alice@example.com", 1),
            disabled("b", "alias@example.com", 2),
        ],
        AddressMode::Split,
    )
    .await;
    let (registry, server, _reporter) = fleet(&h).await;
    assert_eq!(server.registered_addresses(), vec![AddressId::new("a")]);

    let err = registry
        .dispatch(
            &UserId::new(USER),
            SessionEvent::AddressDeleted {
                user_id: UserId::new(USER),
                address_id: AddressId::new("b"),
                email: "alias@example.com".into(),
            },
        )
        .await
        .unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn created_address_is_registered_in_split_mode() {
    let h = harness(vec![Address::new("a", "alice@example.com", 1)], AddressMode::Split).await;
    let (_registry, server, _reporter) = fleet(&h).await;
    settled(&h.session).await;

    let created = AddressEvent::Created(Address::new("c", "carol@example.com", 2));
    h.remote.push(Ok(address_event("c-1", created))).await;

    let c = AddressId::new("c");
    eventually("registration of c", || {
        server.registered_addresses().contains(&c) && h.session.binding(&c).is_some()
    })
    .await;
}

#[tokio::test]
async fn created_disabled_address_is_not_registered() {
    let h = harness(vec![Address::new("a", "alice@example.com", 1)], AddressMode::Split).await;
    let (_registry, server, _reporter) = fleet(&h).await;
    settled(&h.session).await;

    let hidden = AddressEvent::Created(disabled("c", "carol@example.com", 2));
    h.remote.push(Ok(address_event("c-1", hidden))).await;
    let visible = AddressEvent::Created(Address::new("d", "dave@example.com", 3));
    h.remote.push(Ok(address_event("c-2", visible))).await;

    let d = AddressId::new("d");
    eventually("registration of d", || h.session.binding(&d).is_some()).await;
    assert!(h.session.address(&AddressId::new("c")).is_some());
    assert!(h.session.binding(&AddressId::new("c")).is_none());
    assert_eq!(server.registered_addresses(), vec![AddressId::new("a"), d]);
}

#[tokio::test]
async fn deleting_the_combined_primary_moves_its_registration() {
    let h = harness(two_addresses(), AddressMode::Combined).await;
    let (registry, server, _reporter) = fleet(&h).await;
    settled(&h.session).await;
    let a = AddressId::new("a");
    let b = AddressId::new("b");
    let binding = h.session.binding(&a).unwrap();

    h.remote
        .push(Ok(address_event("c-1", AddressEvent::Deleted(a.clone()))))
        .await;

    eventually("registration to follow b", || {
        server.registered_addresses() == vec![b.clone()]
    })
    .await;

    let known: Vec<AddressId> = h.session.addresses().into_iter().map(|addr| addr.id).collect();
    assert!(h.session.bindings().keys().all(|id| known.contains(id)));
    assert_eq!(h.session.binding(&b), Some(binding.clone()));
    assert!(h.session.binding(&a).is_none());
    assert!(server.deprovisioned.lock().unwrap().is_empty());
    assert!(server.loaded.lock().unwrap().contains(&binding));
    assert!(registry.account(&UserId::new(USER)).is_some());
}

#[tokio::test]
async fn refreshed_account_is_registered_anew() {
    let h = harness(two_addresses(), AddressMode::Combined).await;
    let (_registry, server, _reporter) = fleet(&h).await;
    settled(&h.session).await;
    let a = AddressId::new("a");
    assert_eq!(h.session.binding(&a), Some(BindingToken::new("binding-0")));

    let mut ev = RemoteEvent {
        cursor: Cursor::new("c-1"),
        ..RemoteEvent::default()
    };
    ev.refresh = true;
    h.remote.push(Ok(ev)).await;

    eventually("new binding", || {
        h.session.binding(&a) == Some(BindingToken::new("binding-1"))
    })
    .await;
    assert_eq!(
        server.deprovisioned.lock().unwrap().as_slice(),
        &[(BindingToken::new("binding-0"), true)]
    );
    assert_eq!(server.registered_addresses(), vec![a]);
}

#[tokio::test]
async fn disabled_address_is_deregistered() {
    let h = harness(two_addresses(), AddressMode::Split).await;
    let (_registry, server, _reporter) = fleet(&h).await;
    settled(&h.session).await;
    let b = AddressId::new("b");
    let binding = h.session.binding(&b).unwrap();

    let updated = AddressEvent::Updated(disabled("b", "alias@example.com", 2));
    h.remote.push(Ok(address_event("c-1", updated))).await;

    eventually("deregistration of b", || h.session.binding(&b).is_none()).await;
    assert_eq!(
        server.deprovisioned.lock().unwrap().as_slice(),
        &[(binding, false)]
    );
    assert_eq!(server.registered_addresses(), vec![AddressId::new("a")]);
}

#[tokio::test]
async fn deauthorized_account_is_logged_out_without_revoking() {
    let h = harness(two_addresses(), AddressMode::Combined).await;
    let (registry, _server, _reporter) = fleet(&h).await;
    let mut notices = registry.subscribe();

    h.remote.deauthorize();

    let (_, forced) = logged_out(&mut notices).await;
    assert!(forced);
    assert_eq!(h.remote.revoked.load(Ordering::SeqCst), 0);
    assert!(registry.user_ids().is_empty());
}

#[tokio::test]
async fn uncategorized_errors_are_reported() {
    let h = harness(two_addresses(), AddressMode::Combined).await;
    let (_registry, _server, reporter) = fleet(&h).await;
    settled(&h.session).await;

    h.remote.push(Err(Error::Remote("gateway timeout".into()))).await;

    eventually("report", || !reporter.messages().is_empty()).await;
    let (message, context) = reporter.reports.lock().unwrap()[0].clone();
    assert_eq!(message, "Failed to handle due to uncategorized error");
    assert_eq!(context["error_type"], "Remote");
    assert!(h.session.is_consuming_events());
}

#[tokio::test]
async fn user_logout_wipes_everything() {
    let h = harness(two_addresses(), AddressMode::Split).await;
    let (registry, server, _reporter) = fleet(&h).await;
    let mut notices = registry.subscribe();

    registry.logout_account(&UserId::new(USER)).await.unwrap();

    let (_, forced) = logged_out(&mut notices).await;
    assert!(!forced);
    assert_eq!(h.remote.revoked.load(Ordering::SeqCst), 1);
    assert!(server.registered_addresses().is_empty());
    assert!(server.deprovisioned.lock().unwrap().iter().all(|(_, data)| *data));
    assert!(h.store.user_ids().await.unwrap().is_empty());
    assert!(registry.account(&UserId::new(USER)).is_none());
}

#[tokio::test]
async fn shutdown_keeps_registrations() {
    let h = harness(two_addresses(), AddressMode::Combined).await;
    let (registry, server, _reporter) = fleet(&h).await;

    registry.shutdown().await;

    assert!(h.session.is_closed());
    assert!(registry.user_ids().is_empty());
    assert_eq!(server.registered_addresses(), vec![AddressId::new("a")]);
    assert_eq!(h.remote.revoked.load(Ordering::SeqCst), 0);
}

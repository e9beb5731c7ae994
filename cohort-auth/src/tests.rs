// SPDX-License-Identifier: MIT OR Apache-2.0

//! End-to-end scenarios across the whole auth pipeline: facade mutations,
//! serialization, concurrent branches, invitations and key rotation.
use cohort_core::crypto::Rng;

use crate::keyset::Scope;
use crate::reducer;
use crate::resolver::StrongRemove;
use crate::state::ADMIN_ROLE;
use crate::team::Team;
use crate::test_utils::{context_for, member_record};

fn team_of_alice() -> Team {
    Team::create("spies", context_for("alice"), Rng::from_seed([1; 32])).unwrap()
}

#[test]
fn create_append_serialize_load() {
    let mut alice = team_of_alice();
    alice.add_role("managers").unwrap();
    alice
        .add_member(member_record("bob", false), vec![])
        .unwrap();

    let bytes = alice.save().unwrap();
    let bob = Team::load(&bytes, context_for("bob"), Rng::from_seed([2; 32])).unwrap();

    assert_eq!(bob.team_name(), "spies");
    assert!(bob.state().has_role("managers"));
    assert!(bob.state().has_member("bob"));
    assert_eq!(bob.head(), alice.head());
    assert!(bob.graph().validate().is_ok());
}

#[test]
fn concurrent_non_conflicting_changes_merge_cleanly() {
    let mut alice = team_of_alice();
    alice
        .add_member(member_record("bob", false), vec![ADMIN_ROLE.to_string()])
        .unwrap();

    let bytes = alice.save().unwrap();
    let mut bob = Team::load(&bytes, context_for("bob"), Rng::from_seed([2; 32])).unwrap();

    // Disconnected: alice creates a role while bob posts an invitation.
    alice.add_role("managers").unwrap();
    let (_, invitation_id) = bob.invite(None, 1, 0, None).unwrap();

    alice.merge(bob.graph()).unwrap();
    bob.merge(alice.graph()).unwrap();

    assert_eq!(alice.head(), bob.head());
    assert_eq!(alice.state(), bob.state());
    assert!(bob.state().has_role("managers"));
    assert!(alice.state().invitation(&invitation_id).is_some());
}

#[test]
fn mutual_demotion_resolves_for_the_senior_admin() {
    let mut alice = team_of_alice();
    alice
        .add_member(member_record("bob", false), vec![ADMIN_ROLE.to_string()])
        .unwrap();

    let bytes = alice.save().unwrap();
    let mut bob = Team::load(&bytes, context_for("bob"), Rng::from_seed([2; 32])).unwrap();

    // Disconnected mutual demotion.
    alice.remove_member_role("bob", ADMIN_ROLE).unwrap();
    bob.remove_member_role("alice", ADMIN_ROLE).unwrap();

    alice.merge(bob.graph()).unwrap();
    bob.merge(alice.graph()).unwrap();

    assert_eq!(alice.state(), bob.state());
    assert!(alice.state().is_admin("alice"));
    assert!(!alice.state().is_admin("bob"));
    assert!(alice.state().has_member("bob"), "demoted, not removed");
    assert_eq!(
        alice.state().generation(&Scope::role(ADMIN_ROLE)),
        1,
        "the surviving demotion rotated the admin keys once"
    );

    // The senior admin can still read the rotated admin keys.
    assert!(alice.admin_keys().is_ok());
    assert!(bob.admin_keys().is_err(), "bob lost access to admin keys");
}

#[test]
fn removal_rotates_team_keys_and_locks_out_the_removed() {
    let mut alice = team_of_alice();
    alice
        .add_member(member_record("bob", false), vec![])
        .unwrap();

    let bytes = alice.save().unwrap();
    let bob = Team::load(&bytes, context_for("bob"), Rng::from_seed([2; 32])).unwrap();
    assert!(bob.team_keys().is_ok());

    let old_message = alice.encrypt(&Scope::team(), b"before removal").unwrap();

    alice.remove_member("bob").unwrap();
    assert_eq!(alice.state().generation(&Scope::team()), 1);

    let new_message = alice.encrypt(&Scope::team(), b"after removal").unwrap();
    assert_eq!(new_message.generation, 1);

    // Old ciphertext still decrypts: generation 0 keys stay reachable.
    assert_eq!(alice.decrypt(&old_message).unwrap(), b"before removal");

    // A peer still holding the old graph cannot read the new generation.
    assert!(bob.decrypt(&new_message).is_err());
}

#[test]
fn invitation_joins_and_reads_post_rotation_ciphertext() {
    let mut alice = team_of_alice();
    alice
        .add_member(member_record("bob", false), vec![])
        .unwrap();

    // Removing bob rotates the team keys to generation 1.
    alice.remove_member("bob").unwrap();
    alice.add_role("managers").unwrap();
    let secret = alice.encrypt(&Scope::team(), b"managers charter").unwrap();
    assert_eq!(secret.generation, 1);

    // charlie was never connected before; he joins via the seed.
    let (seed, invitation_id) = alice.invite(None, 1, 0, None).unwrap();
    let bytes = alice.save().unwrap();
    let charlie = Team::join(&bytes, &seed, context_for("charlie"), Rng::from_seed([3; 32])).unwrap();

    assert!(charlie.state().has_member("charlie"));
    assert_eq!(
        charlie.decrypt(&secret).unwrap(),
        b"managers charter",
        "the invitee can read team ciphertext sealed before they joined"
    );

    // alice picks up charlie's admission on sync.
    alice.merge(charlie.graph()).unwrap();
    assert!(alice.state().has_member("charlie"));
    assert!(alice.state().invitation(&invitation_id).unwrap().used);
}

#[test]
fn join_with_wrong_seed_is_rejected() {
    let mut alice = team_of_alice();
    alice.invite(Some("duckduckgoosecat"), 1, 0, None).unwrap();

    let bytes = alice.save().unwrap();
    let result = Team::join(
        &bytes,
        "anotherseedvalue",
        context_for("mallory"),
        Rng::from_seed([9; 32]),
    );
    assert!(result.is_err());
}

#[test]
fn admitting_rejects_a_member_record_for_someone_else() {
    let mut alice = team_of_alice();
    let (seed, _) = alice.invite(None, 1, 0, None).unwrap();

    // A valid proof for charlie cannot admit a record for mallory.
    let proof = crate::invitation::generate_proof(&seed, "charlie").unwrap();
    let result = alice.admit(proof, member_record("mallory", false));
    assert!(result.is_err());
    assert!(!alice.state().has_member("mallory"));
}

#[test]
fn revoked_invitation_cannot_join() {
    let mut alice = team_of_alice();
    let (seed, invitation_id) = alice.invite(None, 1, 0, None).unwrap();
    alice.revoke_invitation(invitation_id).unwrap();

    let bytes = alice.save().unwrap();
    let result = Team::join(&bytes, &seed, context_for("charlie"), Rng::from_seed([3; 32]));
    assert!(result.is_err());
}

#[test]
fn compromised_device_rotates_everything_it_could_read() {
    let mut alice = team_of_alice();
    alice
        .add_member(member_record("bob", false), vec![ADMIN_ROLE.to_string()])
        .unwrap();

    let bytes = alice.save().unwrap();
    let mut bob = Team::load(&bytes, context_for("bob"), Rng::from_seed([2; 32])).unwrap();

    // bob enrolls a phone, then loses it.
    let phone_keys = crate::keyset::KeysetWithSecrets::from_seed(
        Scope::device("bob-phone"),
        b"bob-phone",
    );
    bob.add_device(crate::state::Device {
        device_id: "bob-phone".to_string(),
        user_id: "bob".to_string(),
        keys: phone_keys.public(),
    })
    .unwrap();
    bob.remove_device("bob-phone").unwrap();

    let state = bob.state();
    assert!(state.removed_devices.contains_key("bob-phone"));
    assert_eq!(state.generation(&Scope::team()), 1);
    assert_eq!(state.generation(&Scope::role(ADMIN_ROLE)), 1);
    assert_eq!(state.member("bob").unwrap().keys.generation, 1);

    // bob can still use the team with his remaining device.
    assert!(bob.team_keys().is_ok());
    assert_eq!(bob.team_keys().unwrap().generation, 1);

    // alice converges on the same state.
    alice.merge(bob.graph()).unwrap();
    assert_eq!(alice.state(), bob.state());
    assert!(alice.team_keys().is_ok());
}

#[test]
fn merge_reduce_converges_with_strong_remove() {
    let mut alice = team_of_alice();
    alice
        .add_member(member_record("bob", false), vec![ADMIN_ROLE.to_string()])
        .unwrap();

    let bytes = alice.save().unwrap();
    let mut bob = Team::load(&bytes, context_for("bob"), Rng::from_seed([2; 32])).unwrap();

    alice.remove_member_role("bob", ADMIN_ROLE).unwrap();
    bob.add_role("managers").unwrap();
    bob.set_team_name("moles").unwrap();

    alice.merge(bob.graph()).unwrap();
    bob.merge(alice.graph()).unwrap();

    // Either order of reduction yields the same state.
    assert_eq!(alice.state(), bob.state());
    let replayed = reducer::reduce(alice.graph(), &StrongRemove).unwrap();
    assert_eq!(&replayed, alice.state());
}

#[test]
fn updated_listeners_fire_in_program_order() {
    use std::sync::{Arc, Mutex};

    let mut alice = team_of_alice();
    let heads = Arc::new(Mutex::new(Vec::new()));
    let sink = heads.clone();
    alice.on_update(move |event| {
        let crate::team::TeamEvent::Updated { head } = event;
        sink.lock().unwrap().push(*head);
    });

    alice.add_role("managers").unwrap();
    alice.add_role("writers").unwrap();

    let heads = heads.lock().unwrap();
    assert_eq!(heads.len(), 2);
    assert_eq!(heads[1], alice.head());
}

#[test]
fn signing_round_trip_through_team_records() {
    let mut alice = team_of_alice();
    alice
        .add_member(member_record("bob", false), vec![])
        .unwrap();

    let signature = alice.sign(b"payload");
    alice
        .verify_device("alice-laptop", b"payload", &signature)
        .unwrap();
    assert!(
        alice
            .verify_device("bob-laptop", b"payload", &signature)
            .is_err()
    );
}

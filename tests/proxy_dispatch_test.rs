//! Method classification and dispatch behaviour of object proxies.

mod common;

use serde_json::json;
use serial_test::serial;

use common::{domain, setup};
use objtx::{CallResult, Control, Error, MethodPredicate};

#[test]
#[serial]
fn test_unclassified_calls_forward_to_the_underlying_object() {
    let (_dir, store) = setup(false);
    let user = store.create("u1", &[("first", json!("John"))]);

    objtx::transaction(Some("tr1"), |tx| {
        let proxy = tx.wrap(domain(&user))?;
        // `id` is neither reader, writer, nor persistence method.
        let result = proxy.call("id", &[])?.into_value()?;
        assert_eq!(result, json!("u1"));
        Ok(Control::Abort)
    })
    .unwrap();
}

#[test]
#[serial]
fn test_forwarded_object_results_are_rewrapped_when_allowed() {
    let (_dir, store) = setup(false);
    let user = store.create("u1", &[("first", json!("John"))]);

    objtx::transaction(Some("tr1"), |tx| {
        let proxy = tx.wrap(domain(&user))?;

        // proxy_instances defaults to off: the raw object comes back.
        match proxy.call("twin", &[])? {
            CallResult::Object(object) => assert_eq!(object.class_name(), "SimpleUser"),
            other => panic!("expected a raw object, got {:?}", other),
        }

        objtx::configure_class("SimpleUser", |c| {
            c.proxy_instances(true);
        });

        // Re-wrapped through the proxy cache: same key, same proxy.
        match proxy.call("twin", &[])? {
            CallResult::Proxy(twin) => {
                assert_eq!(twin.object_key(), proxy.object_key());
                assert!(std::sync::Arc::ptr_eq(&twin, &proxy));
            }
            other => panic!("expected a proxy, got {:?}", other),
        }
        Ok(Control::Abort)
    })
    .unwrap();
}

#[test]
#[serial]
fn test_dynamic_attribute_reader_runs_against_the_proxy() {
    let (_dir, store) = setup(false);
    let user = store.create("u1", &[("first", json!("John")), ("last", json!("Doe"))]);

    objtx::configure_class("SimpleUser", |c| {
        c.dynamic_attribute_reader(MethodPredicate::one_of(&["full_name"]))
            .dynamic_method("full_name", |proxy, _args| {
                let first = proxy.get("first")?;
                let last = proxy.get("last")?;
                Ok(json!(format!(
                    "{} {}",
                    first.as_str().unwrap_or(""),
                    last.as_str().unwrap_or("")
                )))
            });
    });

    objtx::transaction(Some("tr1"), |tx| {
        let proxy = tx.wrap(domain(&user))?;
        proxy.set("first", json!("Foo"))?;

        // The dynamic body reads through the proxy, so it observes the
        // transaction's pending write and its reads are logged.
        assert_eq!(proxy.get("full_name")?, json!("Foo Doe"));
        assert_eq!(tx.read_set_value(&proxy, "last"), Some(json!("Doe")));
        assert_eq!(user.attr("first"), json!("John"));
        Ok(Control::Abort)
    })
    .unwrap();
}

#[test]
#[serial]
fn test_unregistered_dynamic_reader_is_a_configuration_error() {
    let (_dir, store) = setup(false);
    let user = store.create("u1", &[("first", json!("John"))]);

    objtx::configure_class("SimpleUser", |c| {
        c.dynamic_attribute_reader(MethodPredicate::one_of(&["full_name"]));
    });

    objtx::transaction(Some("tr1"), |tx| {
        let proxy = tx.wrap(domain(&user))?;
        assert!(matches!(
            proxy.get("full_name"),
            Err(Error::Configuration(_))
        ));
        Ok(Control::Abort)
    })
    .unwrap();
}

#[test]
#[serial]
fn test_specialized_dispatch_intercepts_before_classification() {
    let (_dir, store) = setup(false);
    let user = store.create("u1", &[("first", json!("John"))]);

    objtx::configure_class("SimpleUser", |c| {
        c.specialized_dispatch(|_proxy, method, _args| {
            if method == "special" {
                Ok(Some(CallResult::Value(json!("intercepted"))))
            } else {
                Ok(None)
            }
        });
    });

    objtx::transaction(Some("tr1"), |tx| {
        let proxy = tx.wrap(domain(&user))?;
        assert_eq!(proxy.call("special", &[])?.into_value()?, json!("intercepted"));
        // Non-intercepted methods still classify normally.
        assert_eq!(proxy.get("first")?, json!("John"));

        objtx::configure_class("SimpleUser", |c| {
            c.use_specialized_proxy(false);
        });
        // With specialized proxies disabled the call falls through to the
        // underlying object, which knows no such attribute.
        assert_eq!(proxy.call("special", &[])?.into_value()?, json!(null));
        Ok(Control::Abort)
    })
    .unwrap();
}

#[test]
#[serial]
fn test_writer_without_argument_is_rejected() {
    let (_dir, store) = setup(false);
    let user = store.create("u1", &[("first", json!("John"))]);

    objtx::transaction(Some("tr1"), |tx| {
        let proxy = tx.wrap(domain(&user))?;
        assert!(matches!(
            proxy.call("first=", &[]),
            Err(Error::Configuration(_))
        ));
        Ok(Control::Abort)
    })
    .unwrap();
}

#[test]
#[serial]
fn test_reads_are_served_from_the_write_set() {
    let (_dir, store) = setup(false);
    let user = store.create("u1", &[("first", json!("John"))]);

    objtx::transaction(Some("tr1"), |tx| {
        let proxy = tx.wrap(domain(&user))?;
        proxy.set("first", json!("Foo"))?;

        assert_eq!(proxy.get("first")?, json!("Foo"));
        assert_eq!(tx.write_set_value(&proxy, "first"), Some(json!("Foo")));
        // The underlying object never saw the write.
        assert_eq!(user.attr("first"), json!("John"));
        Ok(Control::Abort)
    })
    .unwrap();
}

#[test]
#[serial]
fn test_writing_the_read_value_back_is_not_a_change() {
    let (_dir, store) = setup(false);
    let user = store.create("u1", &[("first", json!("John"))]);

    objtx::transaction(Some("tr1"), |tx| {
        let proxy = tx.wrap(domain(&user))?;
        assert_eq!(proxy.get("first")?, json!("John"));
        proxy.set("first", json!("John"))?;

        assert_eq!(tx.write_set_value(&proxy, "first"), None);
        proxy.save()?;
        Ok(Control::Commit)
    })
    .unwrap();

    assert_eq!(user.attr("first"), json!("John"));
}

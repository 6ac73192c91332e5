mod common;

use std::{
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use common::{create_client, fixture, fixture_with_pool, list_client_names};
use fieldbook_core::{
    billing::LineItem,
    entities::{ClientUpdate, JobStatus, NewEstimate, NewInvoice, NewJob, NewProperty, NewVisit},
    ClientId, EstimateId, Grant, InvoiceId, JobId, PropertyId, TenantContext, VisitId,
};
use fieldbook_storage::{
    current_context, DataError, IsolationError, ScopeObserver, ScopeOutcome, TenantGuard,
};
use futures::FutureExt;

#[derive(Default)]
struct Counts {
    opened: AtomicUsize,
    released: AtomicUsize,
    discarded: AtomicUsize,
}

impl ScopeObserver for Counts {
    fn scope_opened(&self, _context: &TenantContext) {
        self.opened.fetch_add(1, Ordering::SeqCst);
    }

    fn scope_closed(&self, _context: &TenantContext, outcome: ScopeOutcome) {
        let counter = match outcome {
            ScopeOutcome::Released => &self.released,
            ScopeOutcome::Discarded => &self.discarded,
        };
        counter.fetch_add(1, Ordering::SeqCst);
    }
}

impl Counts {
    fn snapshot(&self) -> (usize, usize, usize) {
        (
            self.opened.load(Ordering::SeqCst),
            self.released.load(Ordering::SeqCst),
            self.discarded.load(Ordering::SeqCst),
        )
    }
}

fn line(description: &str, cents: i64) -> LineItem {
    LineItem {
        description: description.to_string(),
        quantity: 1,
        unit_price_cents: cents,
    }
}

#[tokio::test]
async fn listing_clients_only_returns_the_bound_organizations_rows() {
    let fx = fixture().await;
    create_client(&fx.guard, &fx.acme, "Jane Doe").await;
    create_client(&fx.guard, &fx.zen, "Bob Roe").await;

    let zen = list_client_names(&fx.guard, &fx.zen).await.expect("zen clients");
    assert_eq!(zen, vec!["Bob Roe".to_string()]);

    let acme = list_client_names(&fx.guard, &fx.acme).await.expect("acme clients");
    assert_eq!(acme, vec!["Jane Doe".to_string()]);
}

struct AcmeRecords {
    client: ClientId,
    property: PropertyId,
    job: JobId,
    visit: VisitId,
    estimate: EstimateId,
    invoice: InvoiceId,
}

#[tokio::test]
async fn entities_created_under_one_organization_are_invisible_and_immutable_from_another() {
    let fx = fixture().await;
    let records = fx
        .guard
        .run(&fx.acme.org, &fx.acme.member, |scope| {
            async move {
                let client = scope
                    .clients()
                    .create(fieldbook_core::entities::NewClient::named("Jane Doe"))
                    .await?;
                let property = scope
                    .properties()
                    .create(
                        &client.id,
                        NewProperty {
                            address_line: "1 Elm St".into(),
                            city: "Springfield".into(),
                            region: None,
                            postal_code: None,
                        },
                    )
                    .await?;
                let job = scope
                    .jobs()
                    .create(NewJob {
                        client_id: client.id,
                        property_id: Some(property.id),
                        title: "Spring cleanup".into(),
                        description: None,
                        scheduled_for: None,
                    })
                    .await?;
                let start = chrono::Utc::now();
                let visit = scope
                    .visits()
                    .schedule(
                        &job.id,
                        NewVisit {
                            starts_at: start,
                            ends_at: start + chrono::Duration::hours(2),
                            notes: None,
                        },
                    )
                    .await?;
                let estimate = scope
                    .estimates()
                    .create(NewEstimate {
                        client_id: client.id,
                        title: "Hedges".into(),
                        line_items: vec![line("Trim hedges", 12_000)],
                    })
                    .await?;
                let invoice = scope
                    .invoices()
                    .create(NewInvoice {
                        client_id: client.id,
                        job_id: Some(job.id),
                        line_items: vec![line("Cleanup", 30_000)],
                    })
                    .await?;
                Ok::<_, DataError>(AcmeRecords {
                    client: client.id,
                    property: property.id,
                    job: job.id,
                    visit: visit.id,
                    estimate: estimate.id,
                    invoice: invoice.id,
                })
            }
            .boxed()
        })
        .await
        .expect("seed acme");

    let outcome = fx
        .guard
        .run(&fx.zen.org, &fx.zen.member, |scope| {
            async move {
                let mut refusals = Vec::new();
                refusals.push(scope.clients().get(&records.client).await.err());
                refusals.push(
                    scope
                        .clients()
                        .update(
                            &records.client,
                            ClientUpdate {
                                display_name: Some("Hijacked".into()),
                                ..ClientUpdate::default()
                            },
                        )
                        .await
                        .err(),
                );
                refusals.push(scope.clients().archive(&records.client).await.err());
                refusals.push(scope.properties().get(&records.property).await.err());
                refusals.push(
                    scope
                        .properties()
                        .list_for_client(&records.client)
                        .await
                        .err(),
                );
                refusals.push(scope.jobs().get(&records.job).await.err());
                refusals.push(
                    scope
                        .jobs()
                        .update_status(&records.job, JobStatus::Cancelled)
                        .await
                        .err(),
                );
                refusals.push(scope.visits().get(&records.visit).await.err());
                refusals.push(scope.visits().complete(&records.visit).await.err());
                refusals.push(scope.estimates().get(&records.estimate).await.err());
                refusals.push(scope.estimates().convert_to_job(&records.estimate).await.err());
                refusals.push(scope.invoices().get(&records.invoice).await.err());
                refusals.push(scope.invoices().void(&records.invoice).await.err());
                refusals.push(
                    scope
                        .invoices()
                        .create(NewInvoice {
                            client_id: records.client,
                            job_id: None,
                            line_items: vec![line("Sneaky", 1)],
                        })
                        .await
                        .err(),
                );

                let visible = (
                    scope.clients().list(true).await?.len(),
                    scope.jobs().list(None).await?.len(),
                    scope.estimates().list(None).await?.len(),
                    scope.invoices().list(None).await?.len(),
                );
                Ok::<_, DataError>((refusals, visible))
            }
            .boxed()
        })
        .await
        .expect("zen scope");

    let (refusals, visible) = outcome;
    assert_eq!(visible, (0, 0, 0, 0));
    for (index, refusal) in refusals.into_iter().enumerate() {
        assert!(
            matches!(refusal, Some(DataError::NotFound { .. })),
            "operation {index} was not refused as not found: {refusal:?}"
        );
    }

    // Nothing acme owns was touched.
    fx.guard
        .run(&fx.acme.org, &fx.acme.member, |scope| {
            async move {
                let client = scope.clients().get(&records.client).await?;
                assert_eq!(client.display_name, "Jane Doe");
                assert!(!client.archived);
                assert_eq!(scope.jobs().get(&records.job).await?.status, JobStatus::Scheduled);
                assert_eq!(scope.invoices().list(None).await?.len(), 1);
                Ok::<_, DataError>(())
            }
            .boxed()
        })
        .await
        .expect("acme intact");
}

#[tokio::test]
async fn principal_without_membership_is_refused_before_any_storage_work() {
    let fx = fixture().await;
    let counts = Arc::new(Counts::default());
    let guard = TenantGuard::new(fx.db.clone()).with_observer(counts.clone());
    let invoked = Arc::new(AtomicBool::new(false));

    let flag = invoked.clone();
    let result = guard
        .run(&fx.acme.org, &fx.outsider, move |scope| {
            flag.store(true, Ordering::SeqCst);
            async move { scope.clients().list(true).await }.boxed()
        })
        .await;

    assert!(matches!(
        result,
        Err(DataError::Isolation(IsolationError::Unauthorized { .. }))
    ));
    assert!(!invoked.load(Ordering::SeqCst), "unit of work must not run");
    assert_eq!(counts.snapshot(), (0, 0, 0), "no connection was bound");

    // A member of one organization is an outsider to the other.
    let cross = guard
        .run(&fx.zen.org, &fx.acme.member, |scope| {
            async move { scope.clients().list(true).await }.boxed()
        })
        .await;
    assert!(matches!(
        cross,
        Err(DataError::Isolation(IsolationError::Unauthorized { .. }))
    ));
}

#[tokio::test]
async fn unknown_and_disabled_organizations_are_invalid() {
    let fx = fixture().await;
    let unknown = fieldbook_core::OrganizationId::new();
    let result = fx
        .guard
        .run(&unknown, &fx.superadmin, |scope| {
            async move { scope.clients().list(true).await }.boxed()
        })
        .await;
    assert!(matches!(
        result,
        Err(DataError::Isolation(IsolationError::InvalidOrganization(_)))
    ));

    fx.db
        .directory()
        .disable_organization(&fx.zen.org)
        .await
        .expect("disable");
    let result = list_client_names(&fx.guard, &fx.zen).await;
    assert!(matches!(
        result,
        Err(DataError::Isolation(IsolationError::InvalidOrganization(_)))
    ));
}

#[tokio::test]
async fn superadmins_enter_any_organization_as_platform_admins() {
    let fx = fixture().await;
    create_client(&fx.guard, &fx.zen, "Bob Roe").await;
    let (grant, names) = fx
        .guard
        .run(&fx.zen.org, &fx.superadmin, |scope| {
            async move {
                let grant = scope.context().grant;
                let names: Vec<String> = scope
                    .clients()
                    .list(true)
                    .await?
                    .into_iter()
                    .map(|client| client.display_name)
                    .collect();
                Ok::<_, DataError>((grant, names))
            }
            .boxed()
        })
        .await
        .expect("superadmin scope");
    assert_eq!(grant, Grant::PlatformAdmin);
    assert_eq!(names, vec!["Bob Roe".to_string()]);
}

#[tokio::test]
async fn failing_unit_of_work_rolls_back_and_tears_down_once() {
    let fx = fixture_with_pool(1).await;
    let counts = Arc::new(Counts::default());
    let guard = TenantGuard::new(fx.db.clone()).with_observer(counts.clone());

    let result = guard
        .run(&fx.acme.org, &fx.acme.member, |scope| {
            async move {
                scope
                    .clients()
                    .create(fieldbook_core::entities::NewClient::named("Half Written"))
                    .await?;
                Err::<(), _>(DataError::Conflict("boom".into()))
            }
            .boxed()
        })
        .await;
    assert!(matches!(result, Err(DataError::Conflict(_))));
    assert_eq!(counts.snapshot(), (1, 1, 0));

    // Single-connection pool: this is the connection the scope just used.
    assert_eq!(fx.db.session_binding().await.expect("diagnostic"), None);
    let names = list_client_names(&guard, &fx.acme).await.expect("list");
    assert!(names.is_empty(), "write was rolled back: {names:?}");
}

#[tokio::test]
async fn cancelled_unit_of_work_discards_its_connection() {
    let fx = fixture_with_pool(1).await;
    let counts = Arc::new(Counts::default());
    let guard = TenantGuard::new(fx.db.clone()).with_observer(counts.clone());

    let pending = guard.run(&fx.acme.org, &fx.acme.member, |scope| {
        async move {
            scope
                .clients()
                .create(fieldbook_core::entities::NewClient::named("Never Committed"))
                .await?;
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok::<_, DataError>(())
        }
        .boxed()
    });
    let timed_out = tokio::time::timeout(Duration::from_millis(200), pending).await;
    assert!(timed_out.is_err(), "unit of work should still be pending");
    assert_eq!(counts.snapshot(), (1, 0, 1));

    assert_eq!(fx.db.session_binding().await.expect("diagnostic"), None);
    let names = list_client_names(&guard, &fx.acme).await.expect("list");
    assert!(names.is_empty(), "{names:?}");
}

#[tokio::test]
async fn nested_scopes_are_refused_while_the_outer_scope_stays_bound() {
    let fx = fixture().await;
    let guard = fx.guard.clone();
    let zen = fx.zen.org;
    let zen_member = fx.zen.member;
    let acme = fx.acme.org;
    let acme_member = fx.acme.member;

    let nested = fx
        .guard
        .run(&acme, &acme_member, move |_outer| {
            async move {
                let mismatch = guard
                    .run(&zen, &zen_member, |scope| {
                        async move { scope.clients().list(true).await }.boxed()
                    })
                    .await
                    .err();
                let same = guard
                    .run(&acme, &acme_member, |scope| {
                        async move { scope.clients().list(true).await }.boxed()
                    })
                    .await
                    .err();
                let ambient = current_context().map(|context| context.organization_id);
                Ok::<_, DataError>((mismatch, same, ambient))
            }
            .boxed()
        })
        .await
        .expect("outer scope");

    assert!(matches!(
        nested.0,
        Some(DataError::Isolation(IsolationError::NestedContextMismatch { .. }))
    ));
    assert!(matches!(
        nested.1,
        Some(DataError::Isolation(IsolationError::NestedScope(org))) if org == acme
    ));
    assert_eq!(nested.2, Some(acme), "outer context survives refused nesting");
}

#[tokio::test]
async fn closed_scope_rejects_every_data_operation() {
    let fx = fixture().await;
    let client = create_client(&fx.guard, &fx.acme, "Jane Doe").await;
    let client_id = client.id;

    let refused = fx
        .guard
        .run(&fx.acme.org, &fx.acme.member, move |scope| {
            async move {
                scope.close(true).await?;
                let results = vec![
                    scope.clients().list(true).await.err(),
                    scope.clients().get(&client_id).await.err(),
                    scope.properties().list_for_client(&client_id).await.err(),
                    scope.jobs().list(None).await.err(),
                    scope.visits().get(&VisitId::new()).await.err(),
                    scope.estimates().list(None).await.err(),
                    scope.invoices().list(None).await.err(),
                    scope.organization().current().await.err(),
                ];
                Ok::<_, DataError>(results)
            }
            .boxed()
        })
        .await
        .expect("scope");

    assert_eq!(refused.len(), 8);
    for err in refused {
        assert!(
            matches!(err, Some(DataError::Isolation(IsolationError::NoActiveScope))),
            "{err:?}"
        );
    }
}

#[tokio::test]
async fn concurrent_scopes_keep_their_own_tenant() {
    let fx = fixture().await;
    create_client(&fx.guard, &fx.acme, "Jane Doe").await;
    create_client(&fx.guard, &fx.zen, "Bob Roe").await;

    let mut handles = Vec::new();
    for round in 0..12 {
        let guard = fx.guard.clone();
        let (org, member, expected) = if round % 2 == 0 {
            (fx.acme.org, fx.acme.member, "Jane Doe")
        } else {
            (fx.zen.org, fx.zen.member, "Bob Roe")
        };
        handles.push(tokio::spawn(async move {
            let names = guard
                .run(&org, &member, |scope| {
                    async move {
                        tokio::task::yield_now().await;
                        let clients = scope.clients().list(true).await?;
                        Ok::<_, DataError>(
                            clients
                                .into_iter()
                                .map(|client| client.display_name)
                                .collect::<Vec<_>>(),
                        )
                    }
                    .boxed()
                })
                .await
                .expect("scope");
            assert_eq!(names, vec![expected.to_string()]);
        }));
    }
    for handle in handles {
        handle.await.expect("task");
    }
    assert_eq!(fx.db.session_binding().await.expect("diagnostic"), None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_writers_in_two_organizations_all_succeed() {
    let fx = fixture().await;
    let jane = create_client(&fx.guard, &fx.acme, "Jane Doe").await;
    let bob = create_client(&fx.guard, &fx.zen, "Bob Roe").await;

    let mut handles = Vec::new();
    for round in 0..16 {
        let guard = fx.guard.clone();
        let (org, member, client_id) = if round % 2 == 0 {
            (fx.acme.org, fx.acme.member, jane.id)
        } else {
            (fx.zen.org, fx.zen.member, bob.id)
        };
        handles.push(tokio::spawn(async move {
            guard
                .run(&org, &member, move |scope| {
                    async move {
                        scope
                            .clients()
                            .update(
                                &client_id,
                                ClientUpdate {
                                    notes: Some(format!("round {round}")),
                                    ..ClientUpdate::default()
                                },
                            )
                            .await?;
                        tokio::task::yield_now().await;
                        let invoice = scope
                            .invoices()
                            .create(NewInvoice {
                                client_id,
                                job_id: None,
                                line_items: vec![line("Mowing", 4_500)],
                            })
                            .await?;
                        Ok::<_, DataError>((org, invoice.number))
                    }
                    .boxed()
                })
                .await
        }));
    }

    let mut acme_numbers = Vec::new();
    let mut zen_numbers = Vec::new();
    for handle in handles {
        let (org, number) = handle.await.expect("task").expect("every writer succeeds");
        if org == fx.acme.org {
            acme_numbers.push(number);
        } else {
            zen_numbers.push(number);
        }
    }
    acme_numbers.sort_unstable();
    zen_numbers.sort_unstable();
    assert_eq!(acme_numbers, (1..=8).collect::<Vec<i64>>());
    assert_eq!(zen_numbers, (1..=8).collect::<Vec<i64>>());
    assert_eq!(fx.db.session_binding().await.expect("diagnostic"), None);
}

mod common;

use chrono::{Duration, Utc};
use common::{fixture, principal};
use fieldbook_core::{
    billing::LineItem,
    entities::{
        ClientUpdate, EntityError, EstimateStatus, InvoiceStatus, JobStatus, NewClient,
        NewEstimate, NewInvoice, NewJob, NewProperty, NewVisit,
    },
    settings::OrganizationSettings,
    OrganizationUpdate, Role,
};
use fieldbook_storage::DataError;
use futures::FutureExt;

fn items() -> Vec<LineItem> {
    vec![
        LineItem {
            description: "Mow lawn".into(),
            quantity: 3,
            unit_price_cents: 1999,
        },
        LineItem {
            description: "Haul clippings".into(),
            quantity: 1,
            unit_price_cents: 500,
        },
    ]
}

fn taxed_settings() -> OrganizationSettings {
    OrganizationSettings {
        tax_rate_bps: 825,
        invoice_terms_days: 14,
        ..OrganizationSettings::default()
    }
}

#[tokio::test]
async fn client_lifecycle_and_properties() {
    let fx = fixture().await;
    fx.guard
        .run(&fx.acme.org, &fx.acme.member, |scope| {
            async move {
                let client = scope.clients().create(NewClient::named("Jane Doe")).await?;
                let updated = scope
                    .clients()
                    .update(
                        &client.id,
                        ClientUpdate {
                            email: Some("jane@example.com".into()),
                            ..ClientUpdate::default()
                        },
                    )
                    .await?;
                assert_eq!(updated.display_name, "Jane Doe");
                assert_eq!(updated.email.as_deref(), Some("jane@example.com"));
                assert_eq!(updated.organization_id, *scope.organization_id());

                let property = scope
                    .properties()
                    .create(
                        &client.id,
                        NewProperty {
                            address_line: "12 Oak Ave".into(),
                            city: "Shelbyville".into(),
                            region: Some("IL".into()),
                            postal_code: None,
                        },
                    )
                    .await?;
                assert_eq!(scope.properties().list_for_client(&client.id).await?, vec![property]);

                scope.clients().archive(&client.id).await?;
                assert!(scope.clients().list(false).await?.is_empty());
                assert_eq!(scope.clients().list(true).await?.len(), 1);

                let invalid = scope.clients().create(NewClient::named("  ")).await;
                assert!(matches!(invalid, Err(DataError::Entity(EntityError::Validation(_)))));
                Ok::<_, DataError>(())
            }
            .boxed()
        })
        .await
        .expect("client lifecycle");
}

#[tokio::test]
async fn job_transitions_and_visits() {
    let fx = fixture().await;
    fx.guard
        .run(&fx.acme.org, &fx.acme.member, |scope| {
            async move {
                let client = scope.clients().create(NewClient::named("Jane Doe")).await?;
                let job = scope
                    .jobs()
                    .create(NewJob {
                        client_id: client.id,
                        property_id: None,
                        title: "Weekly mowing".into(),
                        description: None,
                        scheduled_for: None,
                    })
                    .await?;
                assert_eq!(job.status, JobStatus::Draft);

                let refused = scope.jobs().update_status(&job.id, JobStatus::Completed).await;
                assert!(matches!(
                    refused,
                    Err(DataError::Entity(EntityError::InvalidTransition { .. }))
                ));

                let start = Utc::now() + Duration::days(1);
                let visit = scope
                    .jobs()
                    .schedule_visit(
                        &job.id,
                        NewVisit {
                            starts_at: start,
                            ends_at: start + Duration::hours(1),
                            notes: Some("Gate code 1234".into()),
                        },
                    )
                    .await?;
                let job = scope.jobs().get(&job.id).await?;
                assert_eq!(job.status, JobStatus::Scheduled);
                assert!(job.scheduled_for.is_some());
                assert_eq!(scope.jobs().list(Some(JobStatus::Scheduled)).await?.len(), 1);
                assert!(scope.jobs().list(Some(JobStatus::Draft)).await?.is_empty());

                let done = scope.jobs().complete_visit(&visit.id).await?;
                assert!(done.completed_at.is_some());
                assert!(matches!(
                    scope.jobs().complete_visit(&visit.id).await,
                    Err(DataError::Conflict(_))
                ));
                assert_eq!(scope.jobs().list_visits(&job.id).await?.len(), 1);

                scope.jobs().update_status(&job.id, JobStatus::InProgress).await?;
                let finished = scope.jobs().update_status(&job.id, JobStatus::Completed).await?;
                assert_eq!(finished.status, JobStatus::Completed);
                Ok::<_, DataError>(())
            }
            .boxed()
        })
        .await
        .expect("job lifecycle");
}

#[tokio::test]
async fn invoices_use_organization_tax_terms_and_numbering() {
    let fx = fixture().await;
    fx.guard
        .run(&fx.acme.org, &fx.acme.member, |scope| {
            async move {
                scope
                    .organization()
                    .update(OrganizationUpdate {
                        settings: Some(taxed_settings()),
                        ..OrganizationUpdate::default()
                    })
                    .await?;
                let client = scope.clients().create(NewClient::named("Jane Doe")).await?;
                let first = scope
                    .invoices()
                    .create(NewInvoice {
                        client_id: client.id,
                        job_id: None,
                        line_items: items(),
                    })
                    .await?;
                let second = scope
                    .invoices()
                    .create(NewInvoice {
                        client_id: client.id,
                        job_id: None,
                        line_items: items(),
                    })
                    .await?;
                assert_eq!((first.number, second.number), (1, 2));
                assert_eq!(first.totals.subtotal_cents, 6497);
                assert_eq!(first.totals.tax_cents, 536);
                assert_eq!(first.totals.total_cents, 7033);
                assert_eq!(first.status, InvoiceStatus::Draft);
                assert_eq!(first.due_on, Utc::now().date_naive() + Duration::days(14));

                let sent = scope.invoices().send(&first.id).await?;
                assert_eq!(sent.status, InvoiceStatus::Sent);
                assert!(sent.issued_at.is_some());

                let paid = scope.invoices().record_payment(&first.id).await?;
                assert_eq!(paid.status, InvoiceStatus::Paid);
                assert!(matches!(
                    scope.invoices().void(&first.id).await,
                    Err(DataError::Entity(EntityError::InvalidTransition { .. }))
                ));

                scope.invoices().send(&second.id).await?;
                let later = Utc::now().date_naive() + Duration::days(30);
                let overdue = scope.invoices().mark_overdue(later).await?;
                assert_eq!(overdue.len(), 1);
                assert_eq!(overdue[0].id, second.id);
                assert_eq!(overdue[0].status, InvoiceStatus::Overdue);
                assert!(scope.invoices().mark_overdue(later).await?.is_empty());
                Ok::<_, DataError>(())
            }
            .boxed()
        })
        .await
        .expect("invoice lifecycle");

    // Numbering is per organization.
    let zen_number = fx
        .guard
        .run(&fx.zen.org, &fx.zen.member, |scope| {
            async move {
                let client = scope.clients().create(NewClient::named("Bob Roe")).await?;
                let invoice = scope
                    .invoices()
                    .create(NewInvoice {
                        client_id: client.id,
                        job_id: None,
                        line_items: items(),
                    })
                    .await?;
                Ok::<_, DataError>(invoice.number)
            }
            .boxed()
        })
        .await
        .expect("zen invoice");
    assert_eq!(zen_number, 1);
}

#[tokio::test]
async fn approved_estimates_convert_into_jobs() {
    let fx = fixture().await;
    fx.guard
        .run(&fx.acme.org, &fx.acme.member, |scope| {
            async move {
                let client = scope.clients().create(NewClient::named("Jane Doe")).await?;
                let estimate = scope
                    .estimates()
                    .create(NewEstimate {
                        client_id: client.id,
                        title: "Patio install".into(),
                        line_items: items(),
                    })
                    .await?;
                assert_eq!(estimate.status, EstimateStatus::Draft);
                assert!(matches!(
                    scope.estimates().convert_to_job(&estimate.id).await,
                    Err(DataError::Entity(EntityError::InvalidTransition { .. }))
                ));

                scope.estimates().update_status(&estimate.id, EstimateStatus::Sent).await?;
                scope
                    .estimates()
                    .update_status(&estimate.id, EstimateStatus::Approved)
                    .await?;
                let (converted, job) = scope.estimates().convert_to_job(&estimate.id).await?;
                assert_eq!(converted.status, EstimateStatus::Converted);
                assert_eq!(converted.job_id, Some(job.id));
                assert_eq!(job.client_id, client.id);
                assert_eq!(job.title, "Patio install");
                assert_eq!(scope.estimates().list(Some(EstimateStatus::Converted)).await?.len(), 1);
                Ok::<_, DataError>(())
            }
            .boxed()
        })
        .await
        .expect("estimate conversion");
}

#[tokio::test]
async fn disabled_estimates_feature_refuses_new_estimates() {
    let fx = fixture().await;
    let result = fx
        .guard
        .run(&fx.acme.org, &fx.acme.member, |scope| {
            async move {
                let mut settings = OrganizationSettings::default();
                settings.features.estimates = false;
                scope
                    .organization()
                    .update(OrganizationUpdate {
                        settings: Some(settings),
                        ..OrganizationUpdate::default()
                    })
                    .await?;
                let client = scope.clients().create(NewClient::named("Jane Doe")).await?;
                scope
                    .estimates()
                    .create(NewEstimate {
                        client_id: client.id,
                        title: "Fence".into(),
                        line_items: items(),
                    })
                    .await
            }
            .boxed()
        })
        .await;
    assert!(matches!(result, Err(DataError::FeatureDisabled("estimates"))));
}

#[tokio::test]
async fn only_managers_edit_the_organization() {
    let fx = fixture().await;
    let crew = principal(&fx.db, "crew@acme.test", false).await;
    fx.db
        .directory()
        .grant_membership(&crew, &fx.acme.org, Role::Member)
        .await
        .expect("membership");

    let refused = fx
        .guard
        .run(&fx.acme.org, &crew, |scope| {
            async move {
                scope
                    .organization()
                    .update(OrganizationUpdate {
                        display_name: Some("Crew Co".into()),
                        ..OrganizationUpdate::default()
                    })
                    .await
            }
            .boxed()
        })
        .await;
    assert!(matches!(refused, Err(DataError::Forbidden(_))));

    let renamed = fx
        .guard
        .run(&fx.acme.org, &fx.acme.member, |scope| {
            async move {
                scope
                    .organization()
                    .update(OrganizationUpdate {
                        display_name: Some("Acme Landscaping".into()),
                        ..OrganizationUpdate::default()
                    })
                    .await
            }
            .boxed()
        })
        .await
        .expect("owner update");
    assert_eq!(renamed.display_name, "Acme Landscaping");
    assert_eq!(renamed.slug, "acme");

    let zen = fx
        .db
        .directory()
        .find_organization(&fx.zen.org)
        .await
        .expect("lookup")
        .expect("zen exists");
    assert_eq!(zen.display_name, "zen");
}
